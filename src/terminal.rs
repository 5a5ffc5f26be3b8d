//! Log output setup for the binary.

use downloader_compat::config::VerbositySetting;

use crate::cli::Args;

pub(crate) fn no_color_env_requested() -> bool {
    std::env::var_os("NO_COLOR").is_some_and(|value| !value.is_empty())
}

pub(crate) fn is_dumb_terminal() -> bool {
    std::env::var("TERM")
        .map(|value| value.eq_ignore_ascii_case("dumb"))
        .unwrap_or(false)
}

pub(crate) fn should_disable_color(
    no_color_flag: bool,
    no_color_env: bool,
    dumb_terminal: bool,
) -> bool {
    no_color_flag || no_color_env || dumb_terminal
}

pub(crate) fn is_no_color_requested(args: &Args) -> bool {
    should_disable_color(args.no_color, no_color_env_requested(), is_dumb_terminal())
}

/// Level used when `RUST_LOG` is unset. CLI flags beat the config file.
pub(crate) fn resolve_default_log_level(args: &Args, configured: VerbositySetting) -> &'static str {
    if args.quiet {
        "error"
    } else if args.verbose > 0 {
        match args.verbose {
            1 => "debug",
            _ => "trace",
        }
    } else {
        match configured {
            VerbositySetting::Default => "info",
            VerbositySetting::Verbose => "debug",
            VerbositySetting::Quiet => "error",
            VerbositySetting::Debug => "trace",
        }
    }
}

/// Whether `-v`/`-q` should override `RUST_LOG`.
pub(crate) fn should_force_cli_log_level(args: &Args) -> bool {
    args.verbose > 0 || args.quiet
}

pub(crate) fn init_tracing(default_level: &str, force_cli_level: bool, no_color: bool) {
    let filter = if force_cli_level {
        tracing_subscriber::EnvFilter::new(default_level)
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level))
    };
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(!no_color)
        .with_env_filter(filter)
        .try_init();
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn test_should_disable_color_any_source() {
        assert!(!should_disable_color(false, false, false));
        assert!(should_disable_color(true, false, false));
        assert!(should_disable_color(false, true, false));
        assert!(should_disable_color(false, false, true));
    }

    #[test]
    fn test_cli_flags_beat_configured_verbosity() {
        let quiet = Args::try_parse_from(["downloader-compat", "-q"]).unwrap();
        assert_eq!(
            resolve_default_log_level(&quiet, VerbositySetting::Debug),
            "error"
        );
        assert!(should_force_cli_log_level(&quiet));

        let verbose = Args::try_parse_from(["downloader-compat", "-vv"]).unwrap();
        assert_eq!(
            resolve_default_log_level(&verbose, VerbositySetting::Quiet),
            "trace"
        );
    }

    #[test]
    fn test_configured_verbosity_applies_without_flags() {
        let args = Args::try_parse_from(["downloader-compat"]).unwrap();
        assert!(!should_force_cli_log_level(&args));
        assert_eq!(
            resolve_default_log_level(&args, VerbositySetting::Default),
            "info"
        );
        assert_eq!(
            resolve_default_log_level(&args, VerbositySetting::Verbose),
            "debug"
        );
    }
}
