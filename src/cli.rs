//! Command-line surface of the `zypak-sandbox` binary.
//!
//! `--get-api`, `--adjust-oom-score`, and `--type=...` are not really
//! "subcommands" in the usual sense — they're the three entry points
//! Chromium's own launcher code calls this binary with — so they are
//! modelled as top-level flags rather than a `Subcommand` enum, since only
//! one is ever meaningful at a time and none take a free-form trailing
//! command.

use clap::Parser;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Print the mimic sandbox API version and exit.
    #[arg(long)]
    pub get_api: bool,

    /// Accepted and ignored; real OOM-score adjustment is the container
    /// runtime's job, not this shim's.
    #[arg(long, num_args = 2, value_names = ["PID", "SCORE"])]
    pub adjust_oom_score: Option<Vec<String>>,

    /// Enter the Zygote broker loop for the given child type (e.g. `zygote`).
    #[arg(long = "type", value_name = "TYPE")]
    pub r#type: Option<String>,

    /// Arguments forwarded verbatim to the broker once it has started
    /// (the rest of the engine's own Zygote invocation).
    #[arg(trailing_var_arg = true)]
    pub rest: Vec<String>,
}

/// What [`Cli`] resolved to: exactly one of the three entry points spec.md
/// §6 names, or the catch-all error case.
pub enum Entry {
    /// `--get-api`: print `1` and exit 0.
    GetApi,
    /// `--adjust-oom-score <pid> <score>`: no-op, exit 0.
    AdjustOomScore,
    /// `--type=<type> ...`: enter the Zygote broker loop.
    Zygote { child_type: String, rest: Vec<String> },
}

impl Cli {
    /// Resolves the parsed flags to a single [`Entry`], or `None` if none
    /// of the recognised flags were given (spec.md: "anything else ->
    /// non-zero exit with an error log").
    pub fn entry(&self) -> Option<Entry> {
        if self.get_api {
            Some(Entry::GetApi)
        } else if self.adjust_oom_score.is_some() {
            Some(Entry::AdjustOomScore)
        } else {
            self.r#type.clone().map(|child_type| Entry::Zygote {
                child_type,
                rest: self.rest.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_api_takes_priority() {
        let cli = Cli {
            get_api: true,
            adjust_oom_score: None,
            r#type: Some("zygote".to_owned()),
            rest: Vec::new(),
        };
        assert!(matches!(cli.entry(), Some(Entry::GetApi)));
    }

    #[test]
    fn no_recognised_flag_is_none() {
        let cli = Cli {
            get_api: false,
            adjust_oom_score: None,
            r#type: None,
            rest: Vec::new(),
        };
        assert!(cli.entry().is_none());
    }
}
