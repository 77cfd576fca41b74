use std::process;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use clap::Parser;
use evdev::Key;

const DEFAULT_COMBO: &str = "KEY_LEFTSHIFT,KEY_RIGHTSHIFT,KEY_ESC";

#[derive(Parser, Debug)]
#[command(
    name = "kloak",
    about = "Anonymizes keystroke and mouse timings on wlroots compositors",
    disable_version_flag = true
)]
struct CliArgs {
    /// maximum additional delay per event, in milliseconds
    #[arg(short, long, default_value_t = 100, value_parser = clap::value_parser!(u32).range(..=2147483647))]
    delay: u32,

    /// milliseconds to wait before grabbing the input devices, so the
    /// session can settle
    #[arg(short, long, default_value_t = 500, value_parser = clap::value_parser!(u32).range(..=2147483647))]
    start_delay: u32,

    /// overlay cursor color, AARRGGBB hex
    #[arg(short, long, default_value = "FFFF0000", value_parser = parse_color)]
    color: u32,

    /// escape key combo: comma-separated slots, each a |-separated list of
    /// alias key names; holding all slots together terminates the daemon
    #[arg(short = 'k', long, default_value = DEFAULT_COMBO, value_parser = parse_combo)]
    esc_key_combo: ComboSpec,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComboSpec(pub Vec<Vec<u32>>);

#[derive(Debug)]
pub struct Config {
    pub max_delay: u32,
    pub start_delay: u32,
    pub color: u32,
    pub combo: Vec<Vec<u32>>,
}

impl Config {
    /// Parse the command line. `--help` prints and exits 0; anything
    /// malformed prints the usage and is reported as a fatal error by the
    /// caller.
    pub fn parse() -> Result<Self> {
        match CliArgs::try_parse() {
            Ok(args) => Ok(Self::from(args)),
            Err(e) if e.kind() == clap::error::ErrorKind::DisplayHelp => {
                let _ = e.print();
                process::exit(0);
            }
            Err(e) => {
                let reason = e
                    .render()
                    .to_string()
                    .lines()
                    .next()
                    .unwrap_or("invalid command line")
                    .trim_start_matches("error: ")
                    .to_owned();
                let _ = e.print();
                Err(anyhow!(reason))
            }
        }
    }
}

impl From<CliArgs> for Config {
    fn from(args: CliArgs) -> Self {
        Self {
            max_delay: args.delay,
            start_delay: args.start_delay,
            color: args.color,
            combo: args.esc_key_combo.0,
        }
    }
}

fn parse_color(s: &str) -> Result<u32, String> {
    if s.len() != 8 {
        return Err(format!("\"{s}\" is not an AARRGGBB color"));
    }
    u32::from_str_radix(s, 16).map_err(|_| format!("\"{s}\" is not an AARRGGBB color"))
}

fn parse_combo(s: &str) -> Result<ComboSpec, String> {
    let mut slots = Vec::new();
    for slot in s.split(',') {
        let mut aliases = Vec::new();
        for name in slot.split('|') {
            let name = name.trim();
            let key =
                Key::from_str(name).map_err(|_| format!("unrecognized key name \"{name}\""))?;
            aliases.push(u32::from(key.code()));
        }
        slots.push(aliases);
    }
    if slots.is_empty() {
        return Err("escape combo must name at least one key".into());
    }
    Ok(ComboSpec(slots))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_surface() {
        let args = CliArgs::try_parse_from(["kloak"]).unwrap();
        let config = Config::from(args);
        assert_eq!(config.max_delay, 100);
        assert_eq!(config.start_delay, 500);
        assert_eq!(config.color, 0xFFFF0000);
        // KEY_LEFTSHIFT, KEY_RIGHTSHIFT, KEY_ESC
        assert_eq!(config.combo, vec![vec![42], vec![54], vec![1]]);
    }

    #[test]
    fn short_flags_are_accepted() {
        let args =
            CliArgs::try_parse_from(["kloak", "-d", "250", "-s", "0", "-c", "80FFFFFF"]).unwrap();
        let config = Config::from(args);
        assert_eq!(config.max_delay, 250);
        assert_eq!(config.start_delay, 0);
        assert_eq!(config.color, 0x80FFFFFF);
    }

    #[test]
    fn combo_slots_support_aliases() {
        let spec = parse_combo("KEY_LEFTSHIFT|KEY_RIGHTSHIFT,KEY_ESC").unwrap();
        assert_eq!(spec.0, vec![vec![42, 54], vec![1]]);
    }

    #[test]
    fn unknown_key_names_are_rejected() {
        assert!(parse_combo("KEY_BOGUS").is_err());
        assert!(CliArgs::try_parse_from(["kloak", "-k", "KEY_BOGUS"]).is_err());
    }

    #[test]
    fn malformed_colors_are_rejected() {
        assert!(parse_color("FF0000").is_err());
        assert!(parse_color("XXFF0000").is_err());
        assert!(parse_color("FFFF0000FF").is_err());
    }

    #[test]
    fn delay_range_is_bounded() {
        assert!(CliArgs::try_parse_from(["kloak", "-d", "2147483647"]).is_ok());
        assert!(CliArgs::try_parse_from(["kloak", "-d", "2147483648"]).is_err());
        assert!(CliArgs::try_parse_from(["kloak", "-d", "-1"]).is_err());
    }

    #[test]
    fn unknown_options_fail_parsing() {
        assert!(CliArgs::try_parse_from(["kloak", "--bogus"]).is_err());
    }
}
