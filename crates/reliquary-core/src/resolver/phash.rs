use crate::error::Result;
use crate::types::PerceptualHash;
use image::imageops::FilterType;

/// 64-bit difference hash: shrink to 9x8 grayscale, then set one bit per
/// pixel pair where the left pixel is brighter than its right neighbour.
pub fn difference_hash(bytes: &[u8]) -> Result<PerceptualHash> {
    let img = image::load_from_memory(bytes)?;
    let small = img.resize_exact(9, 8, FilterType::Triangle).to_luma8();

    let mut hash = 0u64;
    for y in 0..8 {
        for x in 0..8 {
            let left = small.get_pixel(x, y)[0];
            let right = small.get_pixel(x + 1, y)[0];
            hash <<= 1;
            if left > right {
                hash |= 1;
            }
        }
    }
    Ok(PerceptualHash(hash))
}
