//! Encode the EEPROM board config based on a toml configfile.
//!
//! The resulting image is flashed to 0x0808_0000, e.g. with
//! `probe-rs download --format bin --base-address 0x08080000`.

use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use eddyprobe_config::{Config, BASE_ADDR};

/// This doc string acts as a help message when the user runs '--help'
/// as do all doc strings on fields
#[derive(Parser)]
struct Opts {
    /// Path to a configuration file in TOML format.
    #[clap(short, long)]
    config: PathBuf,

    /// Write the binary image to this file. Without it, the image is
    /// printed as hex dump.
    #[clap(short, long)]
    output: Option<PathBuf>,
}

/// Parse and validate a TOML board configuration.
fn parse_config(source: &str) -> Result<Config> {
    let config: Config = toml::from_str(source).context("Could not parse config file")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid config: {}", e))?;
    Ok(config)
}

fn hex_dump(data: &[u8]) -> String {
    data.chunks(4)
        .enumerate()
        .map(|(i, chunk)| {
            let bytes: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
            format!("{:#010x}: {}", BASE_ADDR + i * 4, bytes.join(" "))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn main() -> Result<()> {
    env_logger::init();

    // Parse command line args
    let opts: Opts = Opts::parse();

    // Parse config
    let config_source = fs::read_to_string(&opts.config).context("Could not read config file")?;
    let config = parse_config(&config_source)?;
    log::info!("Loaded config (v{}): {:?}", config.version, config);
    let data = config.serialize();

    match opts.output {
        Some(path) => {
            fs::write(&path, data)
                .with_context(|| format!("Could not write {}", path.display()))?;
            println!("Wrote {} bytes to {}", data.len(), path.display());
        }
        None => println!("{}", hex_dump(&data)),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use eddyprobe_config::{ConfigVersion, FaultPolicy};

    const EXAMPLE: &str = r#"
        version = 1
        i2c_speed_khz = 400
        bus_fault_policy = 0
        bus_devices = [0x2a, 0x2b, 0, 0]
        host_baud = 250000
    "#;

    #[test]
    fn test_parse_example() {
        let config = parse_config(EXAMPLE).unwrap();
        assert_eq!(config.version, ConfigVersion::V1);
        assert_eq!(config.bus_fault_policy, FaultPolicy::Tolerate);
        assert_eq!(config.bus_device(1), Some(0x2b));
        assert_eq!(Config::from_bytes(&config.serialize()).unwrap(), config);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let source = EXAMPLE.replace("0x2b", "0x80");
        let err = parse_config(&source).unwrap_err();
        assert_eq!(err.to_string(), "Invalid config: Invalid I²C address (0x80)");

        let source = EXAMPLE.replace("bus_fault_policy = 0", "bus_fault_policy = 7");
        assert!(parse_config(&source).is_err());
    }

    #[test]
    fn test_hex_dump() {
        let dump = hex_dump(&[1, 2, 3, 4, 5]);
        assert_eq!(dump, "0x08080000: 01 02 03 04\n0x08080004: 05");
    }
}
