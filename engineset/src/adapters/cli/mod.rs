// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::PathBuf;

use clap::{CommandFactory, FromArgMatches, Parser};

#[derive(Parser, Debug)]
#[command(
    name = "engineset",
    version,
    about = "Start ipyparallel engines as an HTCondor job and reverse-tunnel them to the local controller",
    long_about = None,
    after_help = "Configuration precedence: defaults < config file < command-line flags.\n\
Config path precedence: defaults < ENGINESET_CONFIG_PATH < command-line flags.\n\
If --config is omitted, engineset tries ENGINESET_CONFIG_PATH, then the default config file location; missing default config is OK.\n\
Paths in the config file are resolved relative to the config file directory; paths passed as flags are resolved relative to the current working directory.\n\
\n\
Exit status is 0 when the job completed and 1 otherwise."
)]
pub struct Opts {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to a TOML config file. When omitted, engineset uses ENGINESET_CONFIG_PATH if set, otherwise the default config file location if available."
    )]
    pub config: Option<PathBuf>,
    #[arg(
        short = 'n',
        long,
        value_name = "N",
        default_value_t = 1,
        value_parser = clap::value_parser!(u32).range(1..),
        help = "Number of engines to start."
    )]
    pub engines: u32,
    #[arg(
        long,
        value_name = "PATH",
        help = "IPython profile directory holding security/ and pid/. Overrides `profile_dir` from the config file."
    )]
    pub profile_dir: Option<PathBuf>,
    #[arg(
        long,
        value_name = "ID",
        help = "ipyparallel cluster id. Overrides `cluster_id` from the config file."
    )]
    pub cluster_id: Option<String>,
    #[arg(
        long = "to-send",
        value_name = "PATH",
        help = "Extra input file to transfer with the job; repeat for several. Replaces `to_send` from the config file."
    )]
    pub to_send: Vec<PathBuf>,
    #[arg(
        long,
        value_name = "CLAUSE",
        help = "Requirements clause, e.g. 'requirements = (Memory > 2048)'. Overrides `requirements` from the config file."
    )]
    pub requirements: Option<String>,
    #[arg(
        long,
        value_name = "CLAUSE",
        help = "Environment clause, e.g. 'environment = \"OMP_NUM_THREADS=1\"'. Overrides `environments` from the config file."
    )]
    pub environments: Option<String>,
    #[arg(
        long,
        value_name = "SECS",
        help = "Give up if the job is not running after this long. Overrides `job_timeout_secs` from the config file."
    )]
    pub job_timeout_secs: Option<u64>,
    #[arg(
        short,
        long,
        action = clap::ArgAction::SetTrue,
        help = "Enable debug logging and include logs from dependencies. Overrides `verbose` from the config file."
    )]
    pub verbose: bool,
}

pub struct ParsedOpts {
    pub opts: Opts,
    pub verbose_override: Option<bool>,
}

pub fn cli_command() -> clap::Command {
    Opts::command()
}

pub fn parse_opts() -> ParsedOpts {
    parse_from(std::env::args_os()).unwrap_or_else(|err| err.exit())
}

fn parse_from<I, T>(args: I) -> Result<ParsedOpts, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let matches = cli_command().try_get_matches_from(args)?;
    // absent flag means "use the config file", not "false"
    let verbose_override = matches.get_flag("verbose").then_some(true);
    let opts = Opts::from_arg_matches(&matches)?;
    Ok(ParsedOpts {
        opts,
        verbose_override,
    })
}
