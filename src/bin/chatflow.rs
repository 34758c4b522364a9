use std::path::PathBuf;
use std::sync::Arc;

use chatflow::{
    load_flows_from_file, EngineConfig, EngineOutcome, FlowEngine, FlowRegistry, GatewayRecord,
    InboundEvent, LoggingConfig, RecordingGateway,
};
use chrono::{DateTime, TimeDelta, Utc};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "chatflow", version, about = "ChatFlow CLI", author)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 校验流程文件并列出节点数
    Validate { file: PathBuf },
    /// 在终端中模拟一个会话，每行输入一条消息；`/wait <秒>` 推进时钟
    Simulate {
        file: PathBuf,
        #[arg(long)]
        flow: Option<String>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value = "cli")]
        conversation: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    LoggingConfig::init();

    let cli = Cli::parse();
    match cli.command {
        Command::Validate { file } => handle_validate(file)?,
        Command::Simulate {
            file,
            flow,
            config,
            conversation,
        } => handle_simulate(file, flow, config, conversation).await?,
    }
    Ok(())
}

fn handle_validate(file: PathBuf) -> anyhow::Result<()> {
    let flows = load_flows_from_file(&file)?;
    let registry = FlowRegistry::new();
    println!("{:<32} {:<8} {:<8} {}", "Flow", "Version", "Nodes", "Start");
    for flow in flows {
        let published = registry.publish(flow)?;
        println!(
            "{:<32} {:<8} {:<8} {}",
            published.id,
            published.version,
            published.nodes().len(),
            published.start
        );
    }
    Ok(())
}

async fn handle_simulate(
    file: PathBuf,
    flow: Option<String>,
    config: Option<PathBuf>,
    conversation: String,
) -> anyhow::Result<()> {
    let mut engine_config = match config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    }
    .with_env_overrides()?;

    let flows = load_flows_from_file(&file)?;
    let first = flows.first().map(|flow| flow.id.clone());
    engine_config.default_flow_id = flow.or(engine_config.default_flow_id).or(first);

    let gateway = Arc::new(RecordingGateway::new());
    let engine = FlowEngine::new(engine_config).with_gateway(gateway.clone());
    for flow in flows {
        engine.publish(flow)?;
    }

    let mut offset = TimeDelta::zero();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(seconds) = line.strip_prefix("/wait") {
            let Some((shifted, now)) = advance_clock(offset, seconds, Utc::now()) else {
                println!("~ /wait expects a whole number of seconds within range");
                continue;
            };
            offset = shifted;
            let advanced = engine.sweep(now).await?;
            println!("~ clock +{}s, {} conversation(s) advanced", offset.num_seconds(), advanced);
        } else {
            let now = Utc::now().checked_add_signed(offset).unwrap_or(DateTime::<Utc>::MAX_UTC);
            let event = InboundEvent::text(&conversation, line).at(now);
            match engine.handle_event(event).await? {
                EngineOutcome::Advanced { flow_id, phase } => println!("~ {flow_id}: {phase:?}"),
                EngineOutcome::Ignored(reason) => println!("~ ignored: {reason:?}"),
                EngineOutcome::Dropped => println!("~ dropped"),
            }
        }
        render_records(gateway.drain());
    }
    Ok(())
}

/// 解析 `/wait` 参数并推进模拟时钟，返回新的偏移和对应时刻
fn advance_clock(
    offset: TimeDelta,
    seconds: &str,
    now: DateTime<Utc>,
) -> Option<(TimeDelta, DateTime<Utc>)> {
    let seconds: i64 = seconds.trim().parse().ok()?;
    let offset = offset.checked_add(&TimeDelta::try_seconds(seconds)?)?;
    let shifted = now.checked_add_signed(offset)?;
    Some((offset, shifted))
}

fn render_records(records: Vec<GatewayRecord>) {
    for record in records {
        match record {
            GatewayRecord::Sent(message) => match message.text_content() {
                Some(text) => println!("bot> {text}"),
                None => println!("bot> [{:?}] {}", message.kind, message.content),
            },
            GatewayRecord::Escalated(escalation) => println!(
                "!! handoff to {} ({})",
                escalation.queue.as_deref().unwrap_or("default queue"),
                escalation.reason
            ),
            GatewayRecord::Tracked(event) => println!("# {}", event.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_moves_the_clock_forward() {
        let now = Utc::now();
        let (offset, at) = advance_clock(TimeDelta::seconds(5), " 30", now).unwrap();
        assert_eq!(offset, TimeDelta::seconds(35));
        assert_eq!(at, now + TimeDelta::seconds(35));
    }

    #[test]
    fn wait_rejects_bad_or_huge_values() {
        let now = Utc::now();
        assert!(advance_clock(TimeDelta::zero(), "soon", now).is_none());
        assert!(advance_clock(TimeDelta::zero(), &i64::MAX.to_string(), now).is_none());
        assert!(advance_clock(TimeDelta::zero(), "9000000000000", now).is_none());
    }
}
