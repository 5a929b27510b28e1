use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use cppbox::config::{CliArgs, CliCommand};
use cppbox::gateway::{CompileRequest, ExecuteRequest, RequestGateway};
use cppbox::ipc;

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries results
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let config = cli.to_config().context("Failed to load configuration")?;
    let gateway = Arc::new(RequestGateway::from_config(config));

    match cli.command {
        CliCommand::Check => {
            let availability = gateway.check_availability().await;
            print_json(&availability)?;
            if !availability.available {
                std::process::exit(1);
            }
        }

        CliCommand::Compile { source, options } => {
            let source_code = fs::read_to_string(&source)
                .with_context(|| format!("Failed to read {}", source.display()))?;
            let request = CompileRequest {
                source_code,
                options: options.into(),
            };
            // Artifacts are left in place so the printed paths stay usable
            let compiled = gateway.compile(&request).await;
            print_json(&compiled)?;
            if !compiled.success {
                std::process::exit(1);
            }
        }

        CliCommand::Run {
            source,
            stdin,
            stdin_file,
            options,
        } => {
            let source_code = fs::read_to_string(&source)
                .with_context(|| format!("Failed to read {}", source.display()))?;
            let stdin = match (stdin, stdin_file) {
                (Some(text), _) => text,
                (None, Some(path)) => fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                (None, None) => String::new(),
            };
            let code = compile_and_run(&gateway, source_code, options.into(), stdin).await;
            std::process::exit(code);
        }

        CliCommand::Serve => {
            serve_stdio(gateway).await?;
            // A blocked stdin read would otherwise hold the runtime open
            std::process::exit(0);
        }
    }

    Ok(())
}

async fn compile_and_run(
    gateway: &RequestGateway,
    source_code: String,
    options: cppbox::sandbox::CompileOptions,
    stdin: String,
) -> i32 {
    let compiled = gateway
        .compile(&CompileRequest {
            source_code,
            options,
        })
        .await;
    if let Some(warnings) = &compiled.warnings {
        eprintln!("{warnings}");
    }
    if !compiled.success {
        eprintln!("{}", compiled.errors.as_deref().unwrap_or("compilation failed"));
        gateway.cleanup().await;
        return 1;
    }
    log::info!("Compiled in {} ms", compiled.compile_time_ms);

    let executed = gateway
        .execute(&ExecuteRequest::for_compiled(&compiled, stdin))
        .await;
    print!("{}", executed.stdout);
    eprint!("{}", executed.stderr);
    log::info!(
        "Program exited with code {} after {} ms (~{} KB{})",
        executed.exit_code,
        executed.execution_time_ms,
        executed.memory_usage_kb,
        if executed.terminated { ", terminated" } else { "" }
    );

    gateway.cleanup().await;
    executed.exit_code
}

async fn serve_stdio(gateway: Arc<RequestGateway>) -> Result<()> {
    let shutdown_token = CancellationToken::new();
    let mut server = tokio::spawn(ipc::serve(
        tokio::io::stdin(),
        tokio::io::stdout(),
        gateway,
        shutdown_token.clone(),
    ));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
            shutdown_token.cancel();
        }
        res = &mut server => {
            log::info!("Shutdown complete");
            return res?;
        }
    }

    let res = server.await?;
    log::info!("Shutdown complete");
    res
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
