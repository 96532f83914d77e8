//! Password Encryption Utility for the Splunk MCP Server
//!
//! Encrypts a Splunk password against machine-specific identifiers so the
//! result can only be decrypted on this exact machine. Prints a YAML
//! fragment to paste into config.yml.
//!
//! Usage:
//!   cargo run --bin encrypt_password

use std::io::{BufRead, Write};

use anyhow::Context;

use splunk_search_mcp::vault::CredentialVault;

fn main() -> anyhow::Result<()> {
    println!("{}", "=".repeat(60));
    println!("SPLUNK MCP SERVER - PASSWORD ENCRYPTION UTILITY");
    println!("{}", "=".repeat(60));
    println!();
    println!("This utility encrypts your Splunk password using machine-specific");
    println!("identifiers. The encrypted password can ONLY be decrypted");
    println!("on this exact machine.");
    println!();
    println!("IMPORTANT: The same credentials will be used for both UAT and PROD.");
    println!("Only the indexes differ between environments.");
    println!();
    println!("{}", "-".repeat(60));

    println!("\nEnter Splunk credentials:");
    println!("{}", "-".repeat(30));

    let username = prompt_line("Enter username: ")?;
    if username.is_empty() {
        eprintln!("Username cannot be empty. Exiting.");
        std::process::exit(1);
    }

    let password = rpassword::prompt_password("Enter password: ")
        .context("failed to read password")?;
    if password.is_empty() {
        eprintln!("Password cannot be empty. Exiting.");
        std::process::exit(1);
    }

    let confirmation = rpassword::prompt_password("Confirm password: ")
        .context("failed to read password confirmation")?;
    if password != confirmation {
        eprintln!("Passwords don't match. Exiting.");
        std::process::exit(1);
    }

    let vault = CredentialVault::new();
    let sealed = vault.encrypt(&password).context("encryption failed")?;

    // 加密后立刻解密自检, 自检不过就什么都不输出。
    match vault.decrypt(&sealed) {
        Ok(recovered) if recovered == password => {}
        Ok(_) => {
            eprintln!("ERROR: Encryption verification failed!");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("ERROR: Could not verify encryption: {e}");
            std::process::exit(1);
        }
    }

    println!("\u{2713} Password encrypted successfully");

    println!("\n{}", "=".repeat(60));
    println!("ENCRYPTED CREDENTIALS");
    println!("{}", "=".repeat(60));
    println!("\nUpdate the following in your config.yml file:");
    println!("\n```yaml");
    println!("splunk:");
    println!("  username: {username}");
    println!("  password_encrypted: {}", sealed.password_encrypted);
    println!("  password_salt: {}", sealed.password_salt);
    println!("  machine_hash: {}", sealed.machine_hash);
    println!("```");
    println!("\n{}", "=".repeat(60));
    println!("IMPORTANT NOTES:");
    println!("{}", "=".repeat(60));
    println!("1. These encrypted passwords will ONLY work on this machine");
    println!("2. Update config.yml with the values above");
    println!("3. If you move to a different machine, re-run this utility");
    println!("4. Keep a secure backup of your actual password");
    println!();

    Ok(())
}

fn prompt_line(prompt: &str) -> anyhow::Result<String> {
    print!("{prompt}");
    std::io::stdout().flush().context("failed to flush stdout")?;
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read input")?;
    Ok(line.trim().to_string())
}
