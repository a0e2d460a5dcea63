//! vb sample: a compute shader writes an animated gradient into a storage
//! image, which is blitted to the swapchain every frame.
//!
//! With `--headless` no window or surface is created; a single frame is read
//! back and saved as a PNG.
//!
//! ## Usage
//!
//! ```bash
//! glslc apps/vb-compute/shaders/gradient.comp -o apps/vb-compute/shaders/gradient.comp.spv
//! cargo run -p vb-compute -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `-c, --config <PATH>`: TOML configuration (see `vb.toml`)
//! - `-s, --shaders <DIR>`: Directory holding the compiled SPIR-V
//! - `--headless <PNG>`: Render one frame offscreen and write it to `PNG`
//! - `--size <WxH>`: Offscreen size (default: 512x512)
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;
mod gradient;
mod headless;

use std::path::PathBuf;

use vb_app::{init_logging, run_app, AppConfig};

use crate::app::Gradient;

/// Command line options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Args {
    pub config: Option<PathBuf>,
    pub shader_dir: PathBuf,
    pub headless: Option<PathBuf>,
    pub size: (u32, u32),
    pub help: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            config: None,
            shader_dir: PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/shaders")),
            headless: None,
            size: (512, 512),
            help: false,
        }
    }
}

/// `WIDTHxHEIGHT` with both sides non-zero.
pub fn parse_size(text: &str) -> Option<(u32, u32)> {
    let (width, height) = text.split_once(['x', 'X'])?;
    let width = width.trim().parse().ok().filter(|&w: &u32| w > 0)?;
    let height = height.trim().parse().ok().filter(|&h: &u32| h > 0)?;
    Some((width, height))
}

impl Args {
    /// Parse the process arguments.
    pub fn from_env() -> Self {
        Self::parse(std::env::args().skip(1))
    }

    /// Parse arguments (without the program name). Unknown arguments,
    /// malformed sizes and options missing their value are ignored.
    pub fn parse(args: impl IntoIterator<Item = String>) -> Self {
        let mut parsed = Self::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => parsed.config = args.next().map(PathBuf::from),
                "-s" | "--shaders" => {
                    if let Some(dir) = args.next() {
                        parsed.shader_dir = PathBuf::from(dir);
                    }
                }
                "--headless" => parsed.headless = args.next().map(PathBuf::from),
                "--size" => {
                    if let Some(size) = args.next().as_deref().and_then(parse_size) {
                        parsed.size = size;
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
        None => AppConfig::new("vb compute"),
    };

    if let Some(output) = &args.headless {
        init_logging(&config.log_filter);
        return headless::render_to_png(&args, output);
    }

    run_app::<Gradient>(config)
}

fn print_help() {
    eprintln!(
        "vb compute sample

USAGE:
    cargo run -p vb-compute -- [OPTIONS]

OPTIONS:
    -c, --config <PATH>     TOML configuration file
    -s, --shaders <DIR>     Directory with gradient.comp.spv
        --headless <PNG>    Render one frame without a window and save it
        --size <WxH>        Size of the headless frame (default: 512x512)
    -h, --help              Print this help message

KEYS:
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
    fn windowed_by_default() {
        let args = parse(&[]);
        assert_eq!(args, Args::default());
        assert_eq!(args.headless, None);
        assert_eq!(args.size, (512, 512));
    }

    #[test]
    fn headless_with_size() {
        let args = parse(&["--headless", "out.png", "--size", "640x360", "-s", "/tmp/spv"]);
        assert_eq!(args.headless, Some(PathBuf::from("out.png")));
        assert_eq!(args.size, (640, 360));
        assert_eq!(args.shader_dir, PathBuf::from("/tmp/spv"));
    }

    #[test]
    fn size_parsing() {
        assert_eq!(parse_size("1920x1080"), Some((1920, 1080)));
        assert_eq!(parse_size("64X32"), Some((64, 32)));
        assert_eq!(parse_size("0x10"), None);
        assert_eq!(parse_size("10"), None);
        assert_eq!(parse_size("axb"), None);

        let args = parse(&["--size", "wide"]);
        assert_eq!(args.size, Args::default().size);
    }
}
