use crate::CLAP_STYLING;
use clap::{Arg, arg, command};
use std::path::PathBuf;

fn cache_args() -> [Arg; 3] {
    [
        arg!(--"cache" <PATH>)
            .required(false)
            .help("Response cache database (default from config: ~/.cache/runweb/responses.db)"),
        arg!(--"no-cache")
            .required(false)
            .help("Bypass the response cache entirely")
            .action(clap::ArgAction::SetTrue)
            .conflicts_with("cache"),
        arg!(--"max-retries" <COUNT>)
            .required(false)
            .help("Give up on a request after this many retries (default: retry forever)")
            .value_parser(clap::value_parser!(u32)),
    ]
}

fn corpus_args() -> [Arg; 3] {
    [
        arg!(-i --"input" <DIR>)
            .required(false)
            .help("Directory of per-game CSV files (default: output_dir from config)"),
        arg!(--"fraction" <FRACTION>)
            .required(false)
            .help("Read only this leading share of the files, in (0, 1]")
            .value_parser(clap::value_parser!(f64))
            .default_value("1.0"),
        arg!(--"suffix" <SUFFIX>)
            .required(false)
            .help("Only read files ending with this suffix")
            .default_value(".csv"),
    ]
}

fn filter_metadata_arg() -> Arg {
    arg!(--"filter-metadata" <PATH>)
        .required(false)
        .help("Games metadata file; drop games released or created after final_date")
        .value_parser(clap::value_parser!(PathBuf))
}

pub(crate) fn command_argument_builder() -> clap::Command {
    clap::Command::new("runweb")
        .version(env!("CARGO_PKG_VERSION"))
        .bin_name("runweb")
        .styles(CLAP_STYLING)
        .arg(arg!(-q --"quiet" "Suppress banner and non-essential output").required(false))
        .arg(
            arg!(-v --"verbose" "Raise log verbosity (repeat for more)")
                .required(false)
                .action(clap::ArgAction::Count),
        )
        .arg(
            arg!(-c --"config" <PATH>)
                .required(false)
                .help("Settings file (default: ~/.config/runweb/config.toml)")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .subcommand_required(false)
        .subcommand(
            command!("crawl")
                .about(
                    "Walk every game in release order and append raw records to one CSV file \
                per game. Resumable from any checkpoint.",
                )
                .arg(
                    arg!(<KIND>)
                        .required(true)
                        .help("related: the games each player holds personal bests in; history: weekly record holders")
                        .value_parser(["related", "history"]),
                )
                .arg(
                    arg!(--"entity-index" <INDEX>)
                        .required(false)
                        .help("Index of the game to start from")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    arg!(--"sub-index" <INDEX>)
                        .required(false)
                        .help("Index within the first game's player/category list to start from")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    arg!(--"state-file" <PATH>)
                        .required(false)
                        .help("Read the starting checkpoint from, and save the resume checkpoint to, this file")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    arg!(-o --"output-dir" <DIR>)
                        .required(false)
                        .help("Directory for the per-game CSV files (default from config: data/network_raw)"),
                )
                .arg(
                    arg!(-t --"workers" <NUM_WORKERS>)
                        .required(false)
                        .help("Number of games collected at once")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("1"),
                )
                .arg(
                    arg!(--"skip-failed")
                        .required(false)
                        .help("Log a game whose sub-item keeps failing and move on instead of halting")
                        .action(clap::ArgAction::SetTrue),
                )
                .arg(
                    arg!(--"detailed")
                        .required(false)
                        .help("List games with full records instead of the bulk listing")
                        .action(clap::ArgAction::SetTrue),
                )
                .arg(
                    arg!(--"end-date" <DATE>)
                        .required(false)
                        .help("history only: last week to sample, YYYY-MM-DD (default: final_date)"),
                )
                .args(cache_args()),
        )
        .subcommand(
            command!("metadata")
                .about("Write id, name, abbreviation, release date and creation date of every game")
                .arg(
                    arg!(-o --"output" <PATH>)
                        .required(false)
                        .help("Metadata CSV file")
                        .value_parser(clap::value_parser!(PathBuf))
                        .default_value("data/games/metadata/all_games.csv"),
                )
                .args(cache_args()),
        )
        .subcommand(
            command!("aggregate")
                .about("Fold the per-game files into one weighted game-to-game edge list")
                .arg(
                    arg!(-o --"output" <PATH>)
                        .required(false)
                        .help("Edge list CSV file")
                        .value_parser(clap::value_parser!(PathBuf))
                        .default_value("data/network/edges.csv"),
                )
                .arg(filter_metadata_arg())
                .args(corpus_args()),
        )
        .subcommand(
            command!("preferences")
                .about("Write the set of games each user has played")
                .arg(
                    arg!(-o --"output" <PATH>)
                        .required(false)
                        .help("Preferences CSV file")
                        .value_parser(clap::value_parser!(PathBuf))
                        .default_value("data/users/user_preferences.csv"),
                )
                .arg(
                    arg!(--"with-profiles")
                        .required(false)
                        .help("Look up each user's signup date and country")
                        .action(clap::ArgAction::SetTrue),
                )
                .arg(filter_metadata_arg())
                .args(corpus_args())
                .args(cache_args()),
        )
        .subcommand(
            command!("user-runs")
                .about("Count each user's verified runs dated before final_date")
                .arg(
                    arg!(-o --"output" <PATH>)
                        .required(false)
                        .help("Run counts CSV file")
                        .value_parser(clap::value_parser!(PathBuf))
                        .default_value("data/users/user_runs.csv"),
                )
                .arg(
                    arg!(--"start-index" <INDEX>)
                        .required(false)
                        .help("Index into the sorted user list to start from; anything but 0 appends")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("0"),
                )
                .args(corpus_args())
                .args(cache_args()),
        )
        .subcommand(
            command!("filter")
                .about("Drop edges touching games outside the metadata filter")
                .arg(
                    arg!(--"edges" <PATH>)
                        .required(true)
                        .help("Edge list CSV file to filter")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    arg!(--"filter-metadata" <PATH>)
                        .required(true)
                        .help("Games metadata file")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    arg!(-o --"output" <PATH>)
                        .required(true)
                        .help("Filtered edge list CSV file")
                        .value_parser(clap::value_parser!(PathBuf)),
                ),
        )
}
