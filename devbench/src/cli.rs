// CLI argument parsing and definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "devbench")]
#[command(about = "Provision and activate development VMs")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Print records as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    pub debug: bool,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Create a devbench and run the provisioning script
    Create {
        /// Name of the new devbench
        name: String,
        /// Owner of the devbench
        #[arg(short, long)]
        user: String,
        /// Print the log as the script runs
        #[arg(short, long)]
        follow: bool,
    },
    /// Re-run activation for an existing devbench
    Activate {
        /// Devbench ID
        id: String,
        /// Owner of the devbench
        #[arg(short, long)]
        user: String,
        /// Print the log as the script runs
        #[arg(short, long)]
        follow: bool,
    },
    /// List devbenches, newest first
    List {
        /// Only show devbenches owned by this user
        #[arg(short, long)]
        user: Option<String>,
    },
    /// Show the log of a devbench
    Logs {
        /// Devbench ID
        id: String,
    },
    /// Show status and connection details of a devbench
    Status {
        /// Devbench ID
        id: String,
    },
    /// Delete a devbench record
    Delete {
        /// Devbench ID
        id: String,
    },
    /// Copy the database file next to itself with a timestamp suffix
    Backup,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_create_with_follow() {
        let args = Args::try_parse_from(["devbench", "create", "bench1", "--user", "alice", "-f"])
            .unwrap();
        match args.command {
            Command::Create { name, user, follow } => {
                assert_eq!(name, "bench1");
                assert_eq!(user, "alice");
                assert!(follow);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_activate_requires_user() {
        assert!(Args::try_parse_from(["devbench", "activate", "some-id"]).is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args =
            Args::try_parse_from(["devbench", "list", "--json", "--config", "devbench.yaml"])
                .unwrap();
        assert!(args.json);
        assert_eq!(args.config, Some(PathBuf::from("devbench.yaml")));
        assert!(matches!(args.command, Command::List { user: None }));
    }
}
