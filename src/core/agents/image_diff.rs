// src/core/agents/image_diff.rs

//! Difference hashing for comparing screenshots against a reference run.

use crate::core::error::ProbeResult;
use image::DynamicImage;
use image::imageops::FilterType;
use std::path::Path;

const HASH_WIDTH: u32 = 9;
const HASH_HEIGHT: u32 = 8;

/// 64-bit gradient hash: each bit says whether a pixel is darker than its
/// right-hand neighbour in a 9x8 grayscale thumbnail.
pub fn dhash_image(image: &DynamicImage) -> u64 {
    let thumb = image
        .resize_exact(HASH_WIDTH, HASH_HEIGHT, FilterType::Triangle)
        .to_luma8();
    let mut hash = 0u64;
    for y in 0..HASH_HEIGHT {
        for x in 0..HASH_WIDTH - 1 {
            hash <<= 1;
            if thumb.get_pixel(x, y)[0] < thumb.get_pixel(x + 1, y)[0] {
                hash |= 1;
            }
        }
    }
    hash
}

pub fn dhash(path: &Path) -> ProbeResult<u64> {
    Ok(dhash_image(&image::open(path)?))
}

/// Hamming distance between two hashes.
pub fn distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}
