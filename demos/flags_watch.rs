//! Print the environment's flags, then every update pushed by the server,
//! until ctrl-c.
//!
//! ```sh
//! cargo run --example flags_watch -- demos/flagsmith.yml
//! ```
use anyhow::Context;
use flagsmith::{
    FlagQuery, Flagsmith, config::FlagsmithConfig, entities::Flag,
    observability::init_tracing, tracing,
};
use tokio::signal;

fn print_flags(flags: &[Flag]) {
    for flag in flags {
        let value = flag
            .feature_state_value
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        println!(
            "{:<32} {:<8} {}",
            flag.name(),
            if flag.enabled { "on" } else { "off" },
            value
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("flagsmith=info,flags_watch=info")?;

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "demos/flagsmith.yml".to_string());
    let mut config = FlagsmithConfig::load(&path, "flagsmith")
        .with_context(|| format!("loading {path}"))?;
    if let Ok(key) = std::env::var("FLAGSMITH_ENVIRONMENT_KEY") {
        config.environment_key = key;
    }

    let flagsmith = Flagsmith::new(config)?;
    let mut updates = flagsmith.flag_updates();

    let flags = flagsmith.get_feature_flags(FlagQuery::anonymous()).await?;
    print_flags(&flags);
    // already printed
    let _ = updates.borrow_and_update();

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                tracing::info!(
                    updated_at = flagsmith.last_flag_fetch_time(),
                    "flags updated"
                );
                print_flags(&updates.borrow_and_update());
            }
        }
    }

    flagsmith.shutdown().await;
    Ok(())
}
