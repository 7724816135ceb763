//! Fixtures shared by unit tests across modules.

use image::{ImageFormat, Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::Cursor;

use crate::models::property::PropertyRecord;

/// A small PNG whose pixels depend on `seed`.
pub fn png_bytes(seed: u8) -> Vec<u8> {
    let img = RgbImage::from_fn(32, 32, |x, y| {
        Rgb([
            (x as u8).wrapping_mul(7).wrapping_add(seed),
            (y as u8).wrapping_mul(5).wrapping_add(seed / 2),
            seed.wrapping_mul(3),
        ])
    });
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

pub fn record(id: i64, price: f64) -> PropertyRecord {
    PropertyRecord {
        id,
        lat: 47.5 + id as f64 * 0.001,
        long: -122.2,
        sqft_living: 1500.0,
        sqft_lot: 5000.0,
        bedrooms: 3.0,
        bathrooms: 2.0,
        grade: 7.0,
        yr_built: 1980.0,
        floors: None,
        waterfront: None,
        view: None,
        condition: None,
        yr_renovated: None,
        price: Some(price),
    }
}

/// `n` properties whose price is a near-deterministic function of living
/// area and grade, kept within [100000, 900000].
pub fn synthetic_records(n: usize, seed: u64) -> Vec<PropertyRecord> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|i| {
            let sqft_living: f64 = rng.gen_range(800.0..4000.0);
            let grade = rng.gen_range(5..=11) as f64;
            let noise: f64 = rng.gen_range(-5000.0..5000.0);
            let price = (60000.0 + 150.0 * sqft_living + 15000.0 * (grade - 5.0) + noise)
                .clamp(100000.0, 900000.0);
            PropertyRecord {
                id: i as i64 + 1,
                lat: 47.3 + rng.gen_range(0.0..0.4),
                long: -122.4 + rng.gen_range(0.0..0.4),
                sqft_living,
                sqft_lot: rng.gen_range(2000.0..12000.0),
                bedrooms: rng.gen_range(1..=5) as f64,
                bathrooms: rng.gen_range(1..=4) as f64,
                grade,
                yr_built: rng.gen_range(1900..=2015) as f64,
                floors: None,
                waterfront: None,
                view: None,
                condition: None,
                yr_renovated: None,
                price: Some(price),
            }
        })
        .collect()
}
