//! Print an argon2 PHC string for `admin.password_hash` in config.toml.

use std::io::BufRead;

use anyhow::{bail, Context};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "hash_password", about = "Hash a password for the newsbot admin account")]
struct Args {
    /// Password to hash; read from the first line of stdin when omitted
    password: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let password = match args.password {
        Some(p) => p,
        None => std::io::stdin()
            .lock()
            .lines()
            .next()
            .transpose()
            .context("failed to read password from stdin")?
            .unwrap_or_default(),
    };
    if password.is_empty() {
        bail!("Usage: hash_password <password>");
    }

    println!("{}", newsbot::auth::hash_password(&password)?);
    Ok(())
}
