//! CLI command handling.
//!
//! Provides subcommands for:
//! - Listing the registered fixtures (`list`)
//! - Building or pulling a fixture image ahead of a test run (`build`)
//! - Running a fixture by hand until Ctrl-C (`up`)
//! - Checking the local Docker setup (`doctor`)

mod doctor;
mod fixtures;

pub use doctor::run_doctor_command;
pub use fixtures::{run_build_command, run_list_command, run_up_command};

use clap::{ColorChoice, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "fixture-dock")]
#[command(about = "Ephemeral Docker fixtures for end-to-end tests")]
#[command(
    long_about = "fixture-dock builds, starts and tears down the containers end-to-end tests depend on.\nExamples:\n  fixture-dock list  # Show registered fixtures\n  fixture-dock up sshd  # Start an SSH agent until Ctrl-C"
)]
#[command(version)]
#[command(color = ColorChoice::Auto)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// TOML file with additional fixture definitions
    #[arg(long, global = true, env = "FIXTURE_DEFINITIONS")]
    pub definitions: Option<std::path::PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List registered fixtures
    #[command(
        about = "List registered fixtures",
        long_about = "Shows built-in fixtures and those loaded from FIXTURE_DEFINITIONS.\nExample: fixture-dock list"
    )]
    List,

    /// Build or pull the image of a fixture
    #[command(
        about = "Build a fixture image",
        long_about = "Resolves the image of a fixture so later test runs start faster.\nExample: fixture-dock build xvnc-agent"
    )]
    Build {
        /// Fixture name
        fixture: String,
    },

    /// Start a fixture and keep it running until Ctrl-C
    #[command(
        about = "Start a fixture until Ctrl-C",
        long_about = "Provisions a fixture, prints its coordinates and tears it down on Ctrl-C.\nExamples:\n  fixture-dock up sshd\n  fixture-dock up echo-server --json"
    )]
    Up {
        /// Fixture name
        fixture: String,

        /// Print the coordinates as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check that Docker and the fixture definitions are usable
    #[command(
        about = "Diagnose the local setup",
        long_about = "Checks the Docker daemon, build contexts and fixture definitions.\nExample: fixture-dock doctor"
    )]
    Doctor,
}
