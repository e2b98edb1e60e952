//! Minimal demonstration binary.
//!
//! Exercises `pass_cli_core::VaultService` end to end: initialize a vault,
//! unlock it, add/get/list a credential, change the master password, lock.
//! The command-line surface is explicitly out of scope for the vault core
//! (§6) — this binary is a thin, uncomplicated driver so the library can be
//! run and inspected directly, not the specified product surface.

use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use pass_cli_core::clock::SystemRng;
use pass_cli_core::config::Config;
use pass_cli_core::crypto::SystemCrypto;
use pass_cli_core::keychain::NullKeychain;
use pass_cli_core::vault_service::VaultService;
use pass_cli_core::{clock::SystemClock, logging};
use secrecy::SecretString;

#[derive(Parser)]
#[command(name = "pass-cli", version, about = "Demonstration driver for the pass-cli-core vault engine")]
struct Cli {
    /// Path to the vault file (default: the configured vault under ~/.pass-cli)
    #[arg(short, long)]
    vault: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new vault and run a short end-to-end smoke sequence against it.
    Demo,
    /// Initialize a new, empty vault.
    Init,
    /// Add a credential, prompting for the password on stdin.
    Add { service: String, username: String },
    /// Print a credential's username (never its password, on this demo surface).
    Get { service: String },
    /// List stored service names.
    List,
}

fn main() {
    let _ = logging::init_from_config();
    let cli = Cli::parse();
    let vault_path = cli.vault.unwrap_or_else(|| Config::app_dir().join(Config::default().general.default_vault));

    if let Err(err) = run(vault_path, cli.command) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn new_service(vault_path: PathBuf) -> VaultService {
    VaultService::new(vault_path, Config::load(), Box::new(SystemCrypto), Box::new(NullKeychain), Box::new(SystemClock), Box::new(SystemRng))
}

fn run(vault_path: PathBuf, command: Command) -> Result<(), Box<dyn Error>> {
    match command {
        Command::Demo => run_demo(vault_path),
        Command::Init => {
            let mut service = new_service(vault_path);
            let password = prompt_password("Create a master password: ")?;
            service.initialize(&password)?;
            println!("vault initialized at {}", service.path().display());
            Ok(())
        }
        Command::Add { service: name, username } => {
            let mut service = new_service(vault_path);
            let password = prompt_password("Master password: ")?;
            service.unlock(&password)?;
            let credential_password = prompt_password("Credential password: ")?;
            service.add(name.clone(), username, credential_password)?;
            println!("added '{name}'");
            Ok(())
        }
        Command::Get { service: name } => {
            let mut service = new_service(vault_path);
            let password = prompt_password("Master password: ")?;
            service.unlock(&password)?;
            let credential = service.get(&name, true, "demo-cli", None)?;
            println!("{name}: username={}", credential.username);
            Ok(())
        }
        Command::List => {
            let mut service = new_service(vault_path);
            let password = prompt_password("Master password: ")?;
            service.unlock(&password)?;
            for (service_name, username, category) in service.list_metadata()? {
                match category {
                    Some(category) => println!("{service_name}\t{username}\t[{category}]"),
                    None => println!("{service_name}\t{username}"),
                }
            }
            Ok(())
        }
    }
}

/// Exercise the vault service end to end against a disposable path, without
/// touching the real keyboard: initialize, add, lock, unlock, get, change the
/// password, lock again. Demonstrates the contracts in §4.5 and §8's
/// end-to-end scenario 1/2 without requiring interactive input.
fn run_demo(vault_path: PathBuf) -> Result<(), Box<dyn Error>> {
    if vault_path.exists() {
        return Err(format!("refusing to overwrite an existing vault at {}", vault_path.display()).into());
    }

    let mut service = new_service(vault_path);
    let master_password = SecretString::from("Correct-Horse-7!".to_string());
    service.initialize(&master_password)?;
    println!("initialized vault at {}", service.path().display());

    let credential_password = SecretString::from("hunter2-but-better".to_string());
    service.add("github.com", "alice", credential_password)?;
    println!("added credential for github.com");

    service.lock();
    println!("locked");

    service.unlock(&master_password)?;
    let credential = service.get("github.com", true, "demo-cli", None)?;
    println!("unlocked; github.com username = {}", credential.username);

    let new_password = SecretString::from("New-Pass-Word-9$".to_string());
    service.change_password(&new_password)?;
    println!("password changed");

    service.lock();
    match service.unlock(&master_password) {
        Ok(()) => return Err("old password unexpectedly still unlocks the vault".into()),
        Err(_) => println!("old password correctly rejected"),
    }
    service.unlock(&new_password)?;
    println!("new password unlocks the vault");

    service.lock();
    Ok(())
}

fn prompt_password(prompt: &str) -> std::io::Result<SecretString> {
    let raw = rpassword::prompt_password(prompt)?;
    Ok(SecretString::from(raw))
}
