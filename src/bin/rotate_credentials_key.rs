use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use wellness_coach::{
    config::ConfigLoader, crypto::CredentialCipher, db, key_rotation::KeyRotator,
};

const MIN_SECRET_LEN: usize = 32;

/// Re-encrypt stored integration credentials under a new secret.
///
/// The current secret comes from the normal configuration (`WELLNESS_APP_SECRET` or
/// `NEXTAUTH_SECRET`); the new one from the variable named by `--new-secret-env`.
#[derive(Debug, Parser)]
#[command(name = "rotate_credentials_key")]
struct Args {
    /// Environment variable holding the new secret
    #[arg(long, default_value = "WELLNESS_NEW_APP_SECRET")]
    new_secret_env: String,

    /// Report what would change without writing
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let loader = ConfigLoader::new();
    let config = loader.load().context("loading configuration")?;

    let old_secret = config
        .app_secret
        .clone()
        .context("current credential secret not present in configuration")?;
    let new_secret = std::env::var(&args.new_secret_env)
        .with_context(|| format!("reading new secret from {}", args.new_secret_env))?;
    if new_secret == old_secret {
        bail!("new secret is identical to the current one");
    }
    if new_secret.len() < MIN_SECRET_LEN {
        bail!("new secret must be at least {} characters", MIN_SECRET_LEN);
    }

    let old = CredentialCipher::from_secret(&old_secret)
        .map_err(|err| anyhow!("deriving current key: {}", err))?;
    let new = CredentialCipher::from_secret(&new_secret)
        .map_err(|err| anyhow!("deriving new key: {}", err))?;

    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;

    let report = KeyRotator::new(Arc::new(db), old, new)
        .rotate(args.dry_run)
        .await
        .context("rotating credentials")?;

    let verb = if report.dry_run { "Would re-encrypt" } else { "Re-encrypted" };
    println!(
        "{} {} integration record(s) and {} client setting value(s).",
        verb, report.oauth_services_rotated, report.client_values_rotated
    );

    for failure in &report.failures {
        eprintln!(
            "FAILED {} {} {}: {}",
            failure.table, failure.record_id, failure.field, failure.reason
        );
    }

    if !report.is_success() {
        bail!("{} value(s) could not be re-encrypted", report.failures.len());
    }

    Ok(())
}
