use colored::Colorize;
use commands::command_argument_builder;
use runweb::handlers::{
    handle_aggregate, handle_crawl, handle_filter, handle_metadata, handle_preferences,
    handle_user_runs, init_tracing, load_settings, print_banner,
};
use std::path::PathBuf;

mod commands;

#[tokio::main]
async fn main() {
    let cmd = command_argument_builder();
    let chosen_command = cmd.get_matches();
    let quiet = chosen_command.get_flag("quiet");
    let verbosity = chosen_command.get_count("verbose");

    // Show banner unless --quiet flag is set
    if !quiet {
        print_banner();
    }

    if chosen_command.subcommand().is_none() {
        let _ = command_argument_builder().print_help();
        return;
    }

    init_tracing(quiet, verbosity);

    let settings = match load_settings(chosen_command.get_one::<PathBuf>("config")) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{} {:#}", "✗".red().bold(), e);
            std::process::exit(1);
        }
    };

    let result = match chosen_command.subcommand() {
        Some(("crawl", primary_command)) => handle_crawl(primary_command, &settings, quiet).await,
        Some(("metadata", primary_command)) => handle_metadata(primary_command, &settings).await,
        Some(("aggregate", primary_command)) => handle_aggregate(primary_command, &settings),
        Some(("preferences", primary_command)) => {
            handle_preferences(primary_command, &settings).await
        }
        Some(("user-runs", primary_command)) => handle_user_runs(primary_command, &settings).await,
        Some(("filter", primary_command)) => handle_filter(primary_command, &settings),
        _ => unreachable!("clap should ensure we don't get here"),
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "✗".red().bold(), e);
        std::process::exit(1);
    }
}

pub const CLAP_STYLING: clap::builder::styling::Styles = clap::builder::styling::Styles::styled()
    .header(clap_cargo::style::HEADER)
    .usage(clap_cargo::style::USAGE)
    .literal(clap_cargo::style::LITERAL)
    .placeholder(clap_cargo::style::PLACEHOLDER)
    .error(clap_cargo::style::ERROR)
    .valid(clap_cargo::style::VALID)
    .invalid(clap_cargo::style::INVALID);
