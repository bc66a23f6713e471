//! Bench CLI for the Reed-Solomon codec shared by the tank registry's
//! EEPROM integrity procedure. Lets an installer encode, decode, or corrupt
//! 96-byte tank-record buffers against the real codec without any bridge
//! or EEPROM hardware attached, the fleshed-out counterpart of an unused
//! speed-measurement stub this binary replaces.

use std::fs;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use kibble::devices::hardware::rs_codec::{self, CODEWORD, DATA};
use log::{info, warn};
use rand::Rng;

#[derive(Parser, Debug)]
#[command(about = "Encode, decode, or corrupt buffers against the tank-record RS codec")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reads a 96-byte data file and writes its 128-byte RS codeword.
    Encode {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Reads a 128-byte codeword, corrects it if possible, and writes the
    /// recovered 96-byte data back out.
    Decode {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Flips `count` random bytes in a file in place, simulating the kind
    /// of byte-level corruption EEPROM wear or a noisy bus might leave
    /// behind, for exercising the codec's correction path offline.
    Corrupt {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(short, long, default_value_t = 1)]
        count: usize,
    },
}

fn read_exact_sized(path: &PathBuf, expected_len: usize) -> Vec<u8> {
    let bytes = fs::read(path).unwrap_or_else(|e| panic!("failed to read {}: {e}", path.display()));
    if bytes.len() != expected_len {
        panic!("expected {expected_len} bytes in {}, found {}", path.display(), bytes.len());
    }
    bytes
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match args.command {
        Command::Encode { input, output } => {
            let bytes = read_exact_sized(&input, DATA);
            let mut data = [0u8; DATA];
            data.copy_from_slice(&bytes);
            let codeword = rs_codec::encode(&data);
            fs::write(&output, codeword).expect("failed to write codeword");
            info!("encoded {} bytes of data into a {}-byte codeword at {}", DATA, CODEWORD, output.display());
        }
        Command::Decode { input, output } => {
            let bytes = read_exact_sized(&input, CODEWORD);
            let mut codeword = [0u8; CODEWORD];
            codeword.copy_from_slice(&bytes);
            match rs_codec::decode(&mut codeword) {
                Ok(data) => {
                    fs::write(&output, data).expect("failed to write recovered data");
                    info!("decoded {} into {} bytes of data at {}", input.display(), DATA, output.display());
                }
                Err(e) => {
                    warn!("codeword in {} is uncorrectable: {e}", input.display());
                    std::process::exit(1);
                }
            }
        }
        Command::Corrupt { input, output, count } => {
            let mut bytes = fs::read(&input).unwrap_or_else(|e| panic!("failed to read {}: {e}", input.display()));
            if bytes.is_empty() {
                panic!("{} is empty, nothing to corrupt", input.display());
            }
            let mut rng = rand::thread_rng();
            for _ in 0..count {
                let pos = rng.gen_range(0..bytes.len());
                let flip = rng.gen_range(1..=u8::MAX);
                bytes[pos] ^= flip;
            }
            fs::write(&output, &bytes).expect("failed to write corrupted buffer");
            info!("flipped {count} byte(s) in a {}-byte copy of {} at {}", bytes.len(), input.display(), output.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_exact_sized_accepts_matching_length() {
        let dir = std::env::temp_dir().join(format!("rs_tool_test_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("sample.bin");
        fs::write(&path, vec![0u8; DATA]).unwrap();
        let bytes = read_exact_sized(&path, DATA);
        assert_eq!(bytes.len(), DATA);
        fs::remove_dir_all(&dir).ok();
    }
}
