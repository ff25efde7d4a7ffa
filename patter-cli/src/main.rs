use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use patter_core::config::EngineConfig;
use patter_core::dialog::DialogManager;
use patter_core::scenario::{Scenario, Step};
use patter_core::store::Store;
use patter_core::testutil::{MockAdapter, seed_bot_with_scenario};
use patter_core::types::{ConversationKey, Event, EventKind, Platform};

#[derive(Parser)]
#[command(name = "patter-cli")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Inspect and exercise scenario files
    Scenario {
        #[command(subcommand)]
        action: ScenarioAction,
    },
}

#[derive(Subcommand)]
enum ScenarioAction {
    /// Parse and compile a scenario file, reporting the first problem
    Validate {
        /// Path to the scenario JSON file
        file: PathBuf,
    },
    /// Print a summary of the scenario graph
    Show {
        /// Path to the scenario JSON file
        file: PathBuf,
    },
    /// Run a scenario offline through the real engine with scripted inputs
    Simulate {
        /// Path to the scenario JSON file
        file: PathBuf,
        /// Inputs in order; plain text, `btn:<value>` for a button press,
        /// or `/command`. A leading `/start` is implied.
        #[arg(long = "input")]
        inputs: Vec<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Scenario { action } => match action {
            ScenarioAction::Validate { file } => validate(&file),
            ScenarioAction::Show { file } => show(&file),
            ScenarioAction::Simulate { file, inputs } => simulate(&file, &inputs),
        },
    };

    match result {
        Ok(output) => print!("{output}"),
        Err(msg) => {
            eprintln!("{msg}");
            process::exit(1);
        }
    }
}

fn load(file: &Path) -> Result<(String, Scenario), String> {
    let json = std::fs::read_to_string(file)
        .map_err(|e| format!("cannot read '{}': {e}", file.display()))?;
    let scenario = Scenario::from_json("local", "local", 1, &json).map_err(|e| e.to_string())?;
    Ok((json, scenario))
}

fn validate(file: &Path) -> Result<String, String> {
    let (_, scenario) = load(file)?;
    Ok(format!(
        "OK: {} steps, {} variables, start step '{}'\n",
        scenario.graph.steps.len(),
        scenario.graph.variables.len(),
        scenario.graph.start_step,
    ))
}

fn show(file: &Path) -> Result<String, String> {
    let (_, scenario) = load(file)?;
    let mut out = String::new();
    out.push_str(&format!("version:    {}\n", scenario.graph.version));
    out.push_str(&format!("start step: {}\n", scenario.graph.start_step));

    let mut variables: Vec<&String> = scenario.graph.variables.keys().collect();
    variables.sort();
    out.push_str(&format!(
        "variables:  {}\n\n",
        variables
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    ));

    let mut step_ids: Vec<&String> = scenario.graph.steps.keys().collect();
    step_ids.sort();
    for step_id in step_ids {
        let step = scenario.step(step_id).expect("listed step exists");
        let kind = match step {
            Step::Message(_) => "message",
            Step::ConditionalMessage(_) => "conditional_message",
            Step::Action(_) => "action",
        };
        out.push_str(&format!("{step_id} ({kind})\n"));
        if let Some(spec) = step.expected_input() {
            out.push_str(&format!(
                "  expects: {} -> {}\n",
                serde_json::to_value(spec.kind)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default(),
                spec.variable,
            ));
        }
        for button in step.buttons() {
            out.push_str(&format!("  button:  [{}] -> {}\n", button.text, button.value));
        }
    }
    Ok(out)
}

fn simulate(file: &Path, inputs: &[String]) -> Result<String, String> {
    let (json, _) = load(file)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(|e| format!("failed to start runtime: {e}"))?;

    runtime.block_on(async move {
        let store = Arc::new(Store::open_in_memory().map_err(|e| e.to_string())?);
        let (bot_id, _) = seed_bot_with_scenario(&store, &json);
        let manager = DialogManager::new(store, EngineConfig::default());
        let adapter = MockAdapter::new();

        let mut out = String::new();
        let mut update: u64 = 0;
        let mut replied = 0;

        let mut script: Vec<String> = vec!["/start".to_string()];
        script.extend(inputs.iter().cloned());

        for input in script {
            update += 1;
            let kind = if let Some(value) = input.strip_prefix("btn:") {
                EventKind::ButtonPress { value: value.to_string() }
            } else if let Some(command) = input.strip_prefix('/') {
                EventKind::Command { name: command.to_string() }
            } else {
                EventKind::Text { text: input.clone() }
            };
            let event = Event {
                id: format!("sim-{update}"),
                chat_id: "simulator".to_string(),
                kind,
            };

            out.push_str(&format!(">> {input}\n"));
            let outcome = manager.handle_event(&adapter, &bot_id, event).await;

            let sent = adapter.sent();
            for message in &sent[replied..] {
                if let Some(text) = &message.text {
                    out.push_str(&format!("<< {text}\n"));
                }
                for button in &message.buttons {
                    out.push_str(&format!("   [{}]\n", button.text));
                }
            }
            replied = sent.len();
            out.push_str(&format!("   ({outcome:?})\n"));
        }

        let key = ConversationKey::new(&bot_id, Platform::Telegram, "simulator");
        if let Ok(Some(state)) = manager.repository().get(&key) {
            out.push_str(&format!(
                "\nfinal step: {}\ncollected:  {}\n",
                state.current_step,
                serde_json::Value::Object(state.collected),
            ));
        }

        Ok(out)
    })
}
