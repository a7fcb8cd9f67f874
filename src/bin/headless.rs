use std::env;
use std::process::ExitCode;
use std::time::{SystemTime, UNIX_EPOCH};

use agent_sdk_rs::tools::claude_code::{SandboxContext, all_tools};
use agent_sdk_rs::{Agent, AnthropicModel};
use agent_sdk_rs::headless::{self, CliArgs, HeadlessSession};
use serde_json::json;

#[tokio::main]
async fn main() -> ExitCode {
    let args = headless::parse_cli_args(env::args().skip(1));

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("fatal: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: CliArgs) -> Result<(), Box<dyn std::error::Error>> {
    let profile = args.profile.clone().unwrap_or_else(|| "default".to_string());
    let session_id = args.session_id.clone().unwrap_or_else(new_session_id);

    let model_name = env::var("ANTHROPIC_MODEL").unwrap_or_else(|_| "claude-sonnet-4-5".to_string());
    let model = AnthropicModel::from_env(model_name)?;

    let sandbox_root = env::var("CLAUDE_CODE_SANDBOX").ok();
    let ctx = SandboxContext::create(sandbox_root)?;
    let working_dir = ctx.working_dir().display().to_string();

    let tools = all_tools();
    let manifest = json!({
        "tools": tools.iter().map(|tool| tool.name().to_string()).collect::<Vec<_>>(),
    });

    let agent = Agent::builder()
        .model(model)
        .tools(tools)
        .require_done_tool(true)
        .system_prompt(format!(
            "You are a coding assistant driven headlessly. Work only inside this sandbox: {working_dir}. \
             Always call the done tool when a task is complete."
        ))
        .dependency(ctx)
        .max_iterations(64)
        .build()?;

    let session = HeadlessSession {
        session_id,
        profile,
        version: env!("CARGO_PKG_VERSION").to_string(),
        working_dir,
        workspace_context: None,
    };

    headless::run(tokio::io::stdout(), session, manifest, args, agent).await?;

    Ok(())
}

fn new_session_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    format!("headless-{millis}")
}
