use std::fs;
use std::io::{self, Read};

use anyhow::{Context as _, Result, bail};
use pyrite::{Config, Context};

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let mut import_path: Option<String> = None;
    let mut input_path: Option<String> = None;
    let mut script_args: Vec<String> = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--import-path" | "-I" => {
                import_path = Some(
                    args.next()
                        .ok_or_else(|| anyhow::anyhow!("Missing path after {arg}"))?,
                );
            }
            _ => {
                input_path = Some(arg);
                script_args.extend(args.by_ref());
                break;
            }
        }
    }

    let (source, pretty_name) = if let Some(path) = &input_path {
        let source = fs::read_to_string(path).with_context(|| format!("Reading {path}"))?;
        (source, path.clone())
    } else {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Reading stdin")?;
        (buffer, "<stdin>".to_string())
    };

    let mut config = Config::default();
    let mut argv = vec![input_path.unwrap_or_else(|| "<stdin>".to_string())];
    argv.extend(script_args);
    config.argv = argv;

    let mut ctx = Context::new(config);
    if let Some(path) = import_path {
        ctx.set_import_path(&path);
    }

    if ctx.execute(&source, &pretty_name).is_err() {
        let message = ctx.error_message();
        bail!("{}", message.trim_end());
    }
    Ok(())
}
