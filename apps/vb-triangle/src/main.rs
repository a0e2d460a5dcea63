//! vb sample: a textured, vertex-colored quad spinning over a depth buffer.
//!
//! The quad is drawn into an offscreen color target, then blitted into the
//! swapchain image.
//!
//! ## Usage
//!
//! ```bash
//! glslc apps/vb-triangle/shaders/triangle.vert -o apps/vb-triangle/shaders/triangle.vert.spv
//! glslc apps/vb-triangle/shaders/triangle.frag -o apps/vb-triangle/shaders/triangle.frag.spv
//! cargo run -p vb-triangle -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `-c, --config <PATH>`: TOML configuration (see `vb.toml`)
//! - `-t, --texture <PATH>`: Image file to sample (default: generated checkerboard)
//! - `-s, --shaders <DIR>`: Directory holding the compiled SPIR-V
//! - `-h, --help`: Print help message
//!
//! ## Keys
//!
//! - `P`: save a screenshot to the configured directory
//! - `Escape`: quit
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;

use std::path::PathBuf;

use vb_app::{run_app, AppConfig};

use crate::app::Triangle;

/// Command line options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Args {
    pub config: Option<PathBuf>,
    pub texture: Option<PathBuf>,
    pub shader_dir: PathBuf,
    pub help: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            config: None,
            texture: None,
            shader_dir: PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/shaders")),
            help: false,
        }
    }
}

impl Args {
    /// Parse the process arguments.
    pub fn from_env() -> Self {
        Self::parse(std::env::args().skip(1))
    }

    /// Parse arguments (without the program name). Unknown arguments and
    /// options missing their value are ignored.
    pub fn parse(args: impl IntoIterator<Item = String>) -> Self {
        let mut parsed = Self::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => parsed.config = args.next().map(PathBuf::from),
                "-t" | "--texture" => parsed.texture = args.next().map(PathBuf::from),
                "-s" | "--shaders" => {
                    if let Some(dir) = args.next() {
                        parsed.shader_dir = PathBuf::from(dir);
                    }
                }
                "-h" | "--help" => parsed.help = true,
                _ => {}
            }
        }

        parsed
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::from_env();
    if args.help {
        print_help();
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::new("vb triangle"),
    };

    run_app::<Triangle>(config)
}

fn print_help() {
    eprintln!(
        "vb triangle sample

USAGE:
    cargo run -p vb-triangle -- [OPTIONS]

OPTIONS:
    -c, --config <PATH>     TOML configuration file
    -t, --texture <PATH>    Image file to sample (default: checkerboard)
    -s, --shaders <DIR>     Directory with triangle.vert.spv and triangle.frag.spv
    -h, --help              Print this help message

KEYS:
    P                       Save a screenshot
    Escape                  Quit

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::parse(args.iter().map(|s| (*s).to_string()))
    }

    #[test]
    fn defaults_without_arguments() {
        let args = parse(&[]);
        assert_eq!(args, Args::default());
        assert!(args.shader_dir.ends_with("shaders"));
    }

    #[test]
    fn reads_paths() {
        let args = parse(&["--config", "vb.toml", "-t", "brick.png", "-s", "/tmp/spv"]);
        assert_eq!(args.config, Some(PathBuf::from("vb.toml")));
        assert_eq!(args.texture, Some(PathBuf::from("brick.png")));
        assert_eq!(args.shader_dir, PathBuf::from("/tmp/spv"));
        assert!(!args.help);
    }

    #[test]
    fn dangling_option_keeps_default() {
        let args = parse(&["--bogus", "--shaders"]);
        assert_eq!(args.shader_dir, Args::default().shader_dir);
        assert!(parse(&["-h"]).help);
    }
}
