use anyhow::{bail, Context, Result};
use nauto_model::{Credential, CredentialRef};
use nauto_security::{CredentialStore, KeyringStore};
use std::io::{self, IsTerminal, Read};

pub async fn store(
    store: &KeyringStore,
    name: String,
    username: String,
    password_flag: Option<String>,
    password_stdin: bool,
    password_prompt: bool,
) -> Result<()> {
    let password = resolve_password(password_flag, password_stdin, password_prompt)
        .context("password input")?;
    let reference = CredentialRef { name };
    let credential = Credential::UserPassword { username, password };
    store.store(&reference, &credential).await?;
    println!("Stored credential {}", reference.name);
    Ok(())
}

pub async fn resolve(store: &KeyringStore, name: String) -> Result<()> {
    let reference = CredentialRef { name };
    let credential = store.resolve(&reference).await?;
    println!("{:?}", credential);
    Ok(())
}

fn resolve_password(
    password_flag: Option<String>,
    password_stdin: bool,
    password_prompt: bool,
) -> Result<String> {
    if let Some(value) = password_flag {
        eprintln!("warning: --password exposes secrets via argv; prefer --password-prompt or --password-stdin");
        return Ok(value);
    }

    if password_stdin {
        return read_password_from_stdin();
    }

    if password_prompt {
        return prompt_for_password();
    }

    if std::io::stdin().is_terminal() {
        return prompt_for_password();
    }

    bail!(
        "stdin is not a TTY; provide --password-stdin for automation or --password-prompt to force interactive entry"
    );
}

fn prompt_for_password() -> Result<String> {
    let password = rpassword::prompt_password("Credential password: ")
        .context("reading password interactively")?;
    if password.is_empty() {
        bail!("password cannot be empty");
    }
    Ok(password)
}

fn read_password_from_stdin() -> Result<String> {
    let mut buffer = String::new();
    io::stdin()
        .read_to_string(&mut buffer)
        .context("reading password from stdin")?;
    let password = buffer
        .trim_end_matches(|c| c == '\n' || c == '\r')
        .to_string();
    if password.is_empty() {
        bail!("password from stdin cannot be empty");
    }
    Ok(password)
}
