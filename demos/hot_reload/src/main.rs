//! Hot Reload Example
//!
//! Defines two in-memory modules under the watched root:
//!
//! ```text
//! <root>/plugins/echo ──requires──► <root>/shared/format
//! ```
//!
//! Touching either file swaps the `echo` plugin in place: its forks are
//! disposed and applied again from a freshly evaluated module, and every
//! apply logs the module build number.
//!
//! # Usage
//!
//! ```bash
//! mkdir -p plugins shared && touch plugins/echo shared/format
//! cargo run --package hot-reload
//! # in another shell
//! touch shared/format
//! ```
//!
//! With no `[plugins]` table in the configuration, `plugins/echo` and
//! `plugins/echo:loud` are loaded. The process exits with code 51 when a change needs a restart.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use clap::Parser;
use serde_json::{Value, json};
use temper::prelude::*;
use temper::runtime::ConfigLoader;

#[derive(Parser, Debug)]
#[command(name = "hot-reload", about = "Run plugins and hot-swap them on change")]
struct Args {
    /// Configuration file; `temper.toml` is searched for when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Configuration profile, e.g. `production`.
    #[arg(short, long)]
    profile: Option<String>,
}

fn define_modules(root: &Path, modules: &StaticLoader) {
    modules.define(root.join("shared/format"), |_scope| {
        Ok(Exports::Value(json!({ "prefix": ">> " })))
    });

    let builds = Arc::new(AtomicUsize::new(0));
    modules.define(root.join("plugins/echo"), move |scope| {
        let prefix = match scope.require("shared/format")? {
            Exports::Value(format) => format["prefix"].as_str().unwrap_or_default().to_string(),
            _ => String::new(),
        };
        let build = builds.fetch_add(1, Ordering::SeqCst);

        Ok(Exports::Plugin(Plugin::function("echo", move |ctx, config| {
            let prefix = prefix.clone();
            async move {
                let shout = config.get("shout").and_then(Value::as_bool).unwrap_or(false);
                ctx.command("echo", "Repeat a message");
                ctx.on(READY, move |_| info!(build, "echo is ready"));
                ctx.effect(move || {
                    info!(build, "echo disposed");
                    Ok(())
                });
                info!(build, prefix = %prefix, shout, "echo applied");
                Ok(())
            }
        })))
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut loader = ConfigLoader::new().with_current_dir();
    if let Some(path) = &args.config {
        loader = loader.file(path);
    }
    if let Some(profile) = &args.profile {
        loader = loader.profile(profile);
    }
    let (mut config, source) = loader.load_with_source()?;

    if config.plugins.is_empty() {
        config.plugins.insert("plugins/echo".to_string(), json!({}));
        config
            .plugins
            .insert("plugins/echo:loud".to_string(), json!({ "shout": true }));
    }

    let modules = StaticLoader::new();
    let runtime = TemperRuntime::from_config(config, source, Arc::new(modules.clone()))?;
    define_modules(runtime.modules().root(), &modules);

    let exit = runtime.run().await?;
    info!(code = exit.code(), "Exiting");
    std::process::exit(exit.code());
}
