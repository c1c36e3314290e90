//! Mock 余额中心命令行入口

use std::sync::Arc;

use clap::Parser;
use mock_balance_center::{BalanceCenterState, router};
use rust_decimal::Decimal;
use tokio::net::TcpListener;

#[derive(Debug, Parser)]
#[command(name = "mock-balance-center", about = "模拟外部余额中心")]
struct Cli {
    #[arg(long, default_value_t = 3001)]
    port: u16,

    #[arg(long, env = "MOCK_BALANCE_API_KEY", default_value = "dev-api-key")]
    api_key: String,

    /// 预置账户，格式 `user_id:balance`，可重复
    #[arg(long = "account", value_parser = parse_account)]
    accounts: Vec<(String, Decimal)>,

    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_account(value: &str) -> Result<(String, Decimal), String> {
    let (user_id, balance) = value
        .split_once(':')
        .ok_or_else(|| format!("格式应为 user_id:balance，实际为 {value}"))?;
    let balance = balance
        .parse::<Decimal>()
        .map_err(|e| format!("余额无效 {balance}: {e}"))?;
    Ok((user_id.to_string(), balance))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .init();

    let state = Arc::new(BalanceCenterState::new(cli.api_key));
    for (user_id, balance) in &cli.accounts {
        state.add_account(user_id, *balance);
        tracing::info!(user_id = %user_id, balance = %balance, "预置外部账户");
    }

    let addr = format!("0.0.0.0:{}", cli.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Mock 余额中心监听 {}", addr);

    axum::serve(listener, router(state)).await?;
    Ok(())
}
