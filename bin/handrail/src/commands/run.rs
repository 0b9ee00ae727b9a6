use std::sync::Arc;
use std::time::Duration;

use handrail_core::{Config, Paths, StepView};
use handrail_orchestrator::{
    FsmState, LlmPlanner, LlmRefiner, Orchestrator, RuntimeConfig, SseConnector,
};
use handrail_providers::{create_planner_provider, create_refiner_provider, Provider};

/// Plan a session for the instruction, then drive it: print each pending
/// step, ask the user to approve it, and report the outcome.
pub async fn run(instruction: &str, yes: bool) -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;

    let planner_provider: Arc<dyn Provider> = Arc::from(create_planner_provider(&config)?);
    let refiner_provider: Arc<dyn Provider> = Arc::from(create_refiner_provider(&config)?);

    let connector = Arc::new(SseConnector::from_config(&config.automation));
    let parser = Arc::new(LlmPlanner::new(planner_provider, config.planner.max_steps));
    let refiner = Arc::new(LlmRefiner::new(refiner_provider));

    let orchestrator = Orchestrator::new(
        connector,
        parser,
        refiner,
        RuntimeConfig::from_config(&config),
    );
    let handle = orchestrator.handle();

    println!("⏳ Planning session: {}", instruction);
    let steps = handle.start_session(instruction).await?;

    println!();
    println!("Planned {} step(s):", steps.len());
    for (i, step) in steps.iter().enumerate() {
        println!("  {}. {}", i + 1, describe_step(step));
    }

    // Poll the runtime and surface every confirmation request on stdin.
    // Confirming the last visible step means the next Idle is completion;
    // Idle before that means the session was discarded underneath us.
    let mut expect_more = false;
    loop {
        tokio::time::sleep(Duration::from_millis(250)).await;
        let status = handle.status().await?;

        match status.state {
            FsmState::WaitConfirm => {
                let Some(step) = status.step_to_confirm.clone() else {
                    continue;
                };
                let position = status.steps.iter().position(|s| s.id == step.id);
                let number = position.map(|i| i + 1).unwrap_or(0);
                let is_last = position.map(|i| i + 1 == status.steps.len()).unwrap_or(true);

                println!();
                println!(
                    "Step {}/{}: {}",
                    number,
                    status.steps.len(),
                    describe_step(&step)
                );

                let approved = if yes {
                    println!("  (auto-confirmed)");
                    true
                } else {
                    prompt_yes_no("Run this step? [y/N] ").await?
                };

                if approved {
                    handle.confirm_step().await?;
                    expect_more = !is_last;
                } else {
                    handle.reject_steps().await?;
                    println!("Plan rejected.");
                    return Ok(());
                }
            }
            FsmState::Idle => {
                println!();
                if expect_more {
                    println!("Session ended before completing all steps.");
                } else {
                    println!("✓ Session complete");
                }
                return Ok(());
            }
            FsmState::Error => {
                let message = status
                    .last_error
                    .unwrap_or_else(|| "unknown failure".to_string());
                anyhow::bail!("session failed: {}", message);
            }
            FsmState::Execute | FsmState::WaitRefinement => {}
        }
    }
}

fn describe_step(step: &StepView) -> String {
    if step.arguments.is_empty() {
        return step.tool.to_string();
    }
    let args = serde_json::to_string(&step.arguments).unwrap_or_default();
    format!("{} {}", step.tool, args)
}

/// Blocking stdin read off the runtime threads.
async fn prompt_yes_no(prompt: &str) -> anyhow::Result<bool> {
    let prompt = prompt.to_string();
    let line = tokio::task::spawn_blocking(move || {
        use std::io::{BufRead, Write};
        print!("{}", prompt);
        let _ = std::io::stdout().flush();
        let mut input = String::new();
        let _ = std::io::stdin().lock().read_line(&mut input);
        input
    })
    .await?;
    let answer = line.trim().to_lowercase();
    Ok(answer == "y" || answer == "yes")
}
