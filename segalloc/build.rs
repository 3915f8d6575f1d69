use std::env::{self, VarError};
use std::fs::File;
use std::io::Write;
use std::path::Path;

// Matches the 20 MiB ceiling of the classic `memlib` heap simulator.
//
// Baked in at build time so `VecGrower::new` and `SegAlloc::new` take no
// arguments and a whole test run can be capped from the environment.
// `VecGrower::with_limit` overrides it for a single arena.
const DEFAULT_ARENA_LIMIT_BYTES: u32 = 20 * 1024 * 1024;
const SEGALLOC_ARENA_LIMIT_BYTES: &str = "SEGALLOC_ARENA_LIMIT_BYTES";

fn main() {
    create_arena_limit_bytes_file();
    export_rerun_rules();
}

fn create_arena_limit_bytes_file() {
    let out_dir = env::var("OUT_DIR").expect("OUT_DIR environment variable not provided");
    let dest_path = Path::new(&out_dir).join("segalloc_arena_limit_bytes.txt");
    let size: u32 = match env::var(SEGALLOC_ARENA_LIMIT_BYTES) {
        Ok(s) => s
            .parse()
            .expect("Could not interpret SEGALLOC_ARENA_LIMIT_BYTES as a 32 bit unsigned integer"),
        Err(ve) => match ve {
            VarError::NotPresent => DEFAULT_ARENA_LIMIT_BYTES,
            VarError::NotUnicode(_) => panic!(
                "Could not interpret SEGALLOC_ARENA_LIMIT_BYTES as a string representing a 32 bit unsigned integer"
            ),
        },
    };
    let mut f = File::create(&dest_path)
        .expect("Could not create file to store segalloc arena limit metadata.");
    write!(f, "{}", size).expect("Could not write to segalloc arena limit metadata file");
    f.flush()
        .expect("Could not flush write to segalloc arena limit metadata file");
}

fn export_rerun_rules() {
    println!("cargo:rerun-if-env-changed={}", SEGALLOC_ARENA_LIMIT_BYTES);
    for path in ["./Cargo.toml", "./build.rs", "./src/imp_vec.rs"].iter() {
        println!("cargo:rerun-if-changed={}", path);
    }
}
