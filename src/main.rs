//! sideloader - 侧载与激活槽位管理
//!
//! 入口：初始化日志、加载配置、创建编排器，执行命令行给出的一个动词并打印结果。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use sideloader::core::{create_orchestrator, Orchestrator, ShutdownManager};
use sideloader::device::SimulatedDevice;
use sideloader::install::ConsolePrompt;
use sideloader::observability;
use sideloader::slots::EvictionPolicy;

const USAGE: &str = "usage: sideloader [--config PATH] <command> [args]

commands:
  list                          show installed apps
  usage                         show active slot usage
  sideload <path|url>           install an .ipa
  refresh <bundle-id>...        refresh the given apps
  refresh-all                   refresh every active app
  activate <bundle-id> [--evict <bundle-id> | --wait]
  deactivate <bundle-id>
  backup <bundle-id>
  restore <bundle-id>
  remove <bundle-id>
  debug <bundle-id>             enable JIT debugging";

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn one_arg<'a>(args: &'a [String], command: &str) -> anyhow::Result<&'a str> {
    match args {
        [id] => Ok(id.as_str()),
        _ => bail!("'{command}' expects exactly one bundle identifier\n\n{USAGE}"),
    }
}

fn eviction_policy(args: &[String]) -> anyhow::Result<EvictionPolicy> {
    match args {
        [] => Ok(EvictionPolicy::None),
        [flag] if flag == "--wait" => Ok(EvictionPolicy::WaitForSlot),
        [flag, victim] if flag == "--evict" => Ok(EvictionPolicy::Evict(victim.clone())),
        _ => bail!("invalid activate options\n\n{USAGE}"),
    }
}

async fn run(orchestrator: &Orchestrator, command: &str, args: &[String]) -> anyhow::Result<()> {
    match command {
        "list" => print_json(&orchestrator.views().await?),
        "usage" => print_json(&orchestrator.usage().await?),
        "sideload" => {
            let source = one_arg(args, command)?;
            print_json(&orchestrator.sideload(source).await?)
        }
        "refresh" | "refresh-all" => {
            let results = if command == "refresh" {
                if args.is_empty() {
                    bail!("'refresh' expects at least one bundle identifier\n\n{USAGE}");
                }
                orchestrator.refresh(args).await?
            } else {
                orchestrator.refresh_all().await?
            };
            for (id, result) in &results {
                match result {
                    Ok(record) => println!("{id}: refreshed, expires {}", record.expires_at),
                    Err(e) => println!("{id}: {e}"),
                }
            }
            Ok(())
        }
        "activate" => {
            let (id, rest) = args.split_first().context("'activate' expects a bundle identifier")?;
            let policy = eviction_policy(rest)?;
            print_json(&orchestrator.activate(id, policy).await?)
        }
        "deactivate" => print_json(&orchestrator.deactivate(one_arg(args, command)?).await?),
        "backup" => print_json(&orchestrator.backup(one_arg(args, command)?).await?),
        "restore" => print_json(&orchestrator.restore(one_arg(args, command)?).await?),
        "remove" => print_json(&orchestrator.remove(one_arg(args, command)?).await?),
        "debug" => print_json(&orchestrator.enable_debugging(one_arg(args, command)?).await?),
        other => bail!("unknown command '{other}'\n\n{USAGE}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志：默认 info，可通过 RUST_LOG 覆盖
    observability::init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let mut config_path: Option<PathBuf> = None;
    if args.first().map(String::as_str) == Some("--config") {
        if args.len() < 2 {
            bail!("--config expects a path\n\n{USAGE}");
        }
        config_path = Some(PathBuf::from(args.remove(1)));
        args.remove(0);
    }
    let Some((command, rest)) = args.split_first() else {
        println!("{USAGE}");
        return Ok(());
    };

    // Ctrl+C / SIGTERM 取消所有进行中操作
    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    // 设备传输是黑盒，命令行运行时使用模拟设备
    let orchestrator = create_orchestrator(
        config_path,
        Arc::new(SimulatedDevice::new()),
        Arc::new(ConsolePrompt),
        shutdown.token(),
    )
    .await
    .context("Failed to create orchestrator")?;

    run(&orchestrator, command, rest)
        .await
        .with_context(|| format!("'{command}' failed"))
}
