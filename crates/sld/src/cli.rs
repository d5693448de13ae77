//! CLI definitions.

use std::ffi::OsString;
use std::path::PathBuf;

use clap::Parser;

/// Exit code for any failure, including usage errors.
pub const EXIT_FAILURE: i32 = 1;

#[derive(Parser, Debug)]
#[command(name = "sld")]
#[command(about = "Static ELF32 loader - maps an i386 executable and jumps to it")]
#[command(version)]
pub struct Cli {
    /// Enable verbose output (sets RUST_LOG=debug)
    #[arg(short, long)]
    pub verbose: bool,

    /// Suppress output (only show errors)
    #[arg(short, long, conflicts_with = "verbose")]
    pub silent: bool,

    /// ELF32 executable to load, followed by the arguments passed to it
    #[arg(
        value_name = "ELF",
        required = true,
        num_args = 1..,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub command: Vec<OsString>,
}

impl Cli {
    /// Split the command into the image path and the program's own arguments.
    #[must_use]
    pub fn into_image(self) -> (PathBuf, Vec<OsString>) {
        let mut command = self.command.into_iter();
        let path = command.next().map(PathBuf::from).unwrap_or_default();
        (path, command.collect())
    }

    /// Default log filter for the chosen verbosity.
    pub const fn log_directive(&self) -> &'static str {
        if self.verbose {
            "sld=debug"
        } else if self.silent {
            "sld=error"
        } else {
            "sld=info"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(args: &[&str]) -> (PathBuf, Vec<OsString>) {
        Cli::try_parse_from(args).unwrap().into_image()
    }

    #[test]
    fn test_passes_hyphenated_args_through() {
        let cli = Cli::try_parse_from(["sld", "prog.elf", "-v", "--flag", "x"]).unwrap();
        assert!(!cli.verbose);
        assert_eq!(cli.log_directive(), "sld=info");
        let (path, args) = cli.into_image();
        assert_eq!(path, PathBuf::from("prog.elf"));
        assert_eq!(args, ["-v", "--flag", "x"]);
    }

    #[test]
    fn test_program_flags_shadowing_loader_flags() {
        let cli = Cli::try_parse_from(["sld", "prog.elf", "-v"]).unwrap();
        assert!(!cli.verbose);
        assert_eq!(cli.into_image().1, ["-v"]);

        let cli = Cli::try_parse_from(["sld", "prog.elf", "-s", "x"]).unwrap();
        assert!(!cli.silent);
        assert_eq!(cli.into_image().1, ["-s", "x"]);

        let (path, args) = image(&["sld", "prog.elf", "--help"]);
        assert_eq!(path, PathBuf::from("prog.elf"));
        assert_eq!(args, ["--help"]);

        let (_, args) = image(&["sld", "prog.elf", "--version", "--", "-x"]);
        assert_eq!(args, ["--version", "--", "-x"]);
    }

    #[test]
    fn test_loader_options() {
        let cli = Cli::try_parse_from(["sld", "-s", "prog.elf"]).unwrap();
        assert!(cli.silent);
        assert_eq!(cli.log_directive(), "sld=error");
        let (path, args) = cli.into_image();
        assert_eq!(path, PathBuf::from("prog.elf"));
        assert!(args.is_empty());

        let cli = Cli::try_parse_from(["sld", "--verbose", "prog.elf", "a"]).unwrap();
        assert_eq!(cli.log_directive(), "sld=debug");
        assert_eq!(cli.into_image().1, ["a"]);
    }

    #[test]
    fn test_missing_image_is_an_error() {
        assert!(Cli::try_parse_from(["sld"]).is_err());
        assert!(Cli::try_parse_from(["sld", "-v"]).is_err());
        assert!(Cli::try_parse_from(["sld", "-v", "-s", "x"]).is_err());
    }
}
