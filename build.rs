// build.rs
use std::env;
use std::fs::File;
use std::io::Write;
use std::path::Path;

fn main() {
    // Per-build seed for the decoy noise generator
    let decoy_seed = generate_random_seed_u64();

    let out_dir = env::var_os("OUT_DIR").expect("OUT_DIR is set by cargo");
    let dest_path = Path::new(&out_dir).join("decoy_seed.rs");

    let mut f = File::create(&dest_path).expect("cannot create decoy_seed.rs");

    // Just write the literal value so it can be included as an expression
    writeln!(f, "0x{:016X}u64", decoy_seed).expect("cannot write decoy_seed.rs");

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=src/protector/entropy.rs");
}

// Pseudo-random 64-bit seed based on the build environment
fn generate_random_seed_u64() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    let mut seed = (now & 0xFFFF_FFFF_FFFF_FFFF) as u64;
    seed ^= (now >> 64) as u64;

    if let Ok(pwd) = env::current_dir() {
        let h = pwd.to_string_lossy().bytes().fold(0u64, |acc, b| {
            acc.rotate_left(7).wrapping_add(b as u64)
        });
        seed ^= h;
    }

    if let Ok(target) = env::var("TARGET") {
        seed ^= target.bytes().fold(0u64, |acc, b| acc.rotate_left(3) ^ (b as u64));
    }

    // Different clones get different seeds
    if let Ok(manifest) = env::var("CARGO_MANIFEST_DIR") {
        let h = manifest.bytes().fold(0u64, |acc, b| {
            acc.rotate_right(5) ^ (b as u64)
        });
        seed = seed.rotate_left(17) ^ h;
    }

    if seed == 0 {
        seed = 0x9A3F_C5D7_1B2E_6F40;
    }

    seed
}
