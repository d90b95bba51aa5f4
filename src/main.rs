use std::env;
use std::sync::Arc;

use dotenv::dotenv;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use gridcoord::coordination::{Agent, AgentConfig, Coordinator, CoordinatorConfig};
use gridcoord::env::{GridParams, Scenario};
use gridcoord::infra::{CompositeObserver, CoordinationObserver, TrackFile, TracingObserver};
use gridcoord::planners::{QmdpConfig, QmdpPlanner};
use gridcoord::state::BeliefArena;

fn get_env_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|val| val.parse::<T>().ok())
}

fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gridcoord=debug,info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn load_scenario(name: &str) -> Result<Scenario, Box<dyn std::error::Error>> {
    if name == "crossing" {
        return Ok(Scenario::crossing()?);
    }
    let layout = std::fs::read_to_string(name)?;
    Ok(Scenario::from_ascii(&layout)?)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    init_logging()?;

    let scenario_name = env::var("GRIDCOORD_SCENARIO").unwrap_or_else(|_| "crossing".to_string());
    let episodes = get_env_var::<usize>("GRIDCOORD_EPISODES").unwrap_or(10);
    let max_steps = get_env_var::<usize>("GRIDCOORD_MAX_STEPS").unwrap_or(50);
    let seed = get_env_var::<u64>("GRIDCOORD_SEED").unwrap_or(0);
    let threshold = get_env_var::<usize>("GRIDCOORD_THRESHOLD").unwrap_or(2);
    let workers = get_env_var::<usize>("GRIDCOORD_WORKERS").unwrap_or(1);
    let tracks_folder = env::var("GRIDCOORD_TRACKS_FOLDER").ok();
    let joint_fallback = get_env_var::<bool>("GRIDCOORD_JOINT_FALLBACK").unwrap_or(true);
    let mut params = GridParams::default();
    if let Some(slip) = get_env_var::<f64>("GRIDCOORD_SLIP") {
        params.slip = slip;
    }

    let scenario = load_scenario(&scenario_name)?;
    tracing::info!(
        "Scenario {}: {} agents, {} beacons, slip {}",
        scenario_name,
        scenario.agents.len(),
        scenario.beacons.len(),
        params.slip
    );
    tracing::debug!("\n{}", scenario.draw());

    let planner = QmdpPlanner::new(QmdpConfig {
        workers,
        ..QmdpConfig::default()
    });
    let config = CoordinatorConfig {
        joint_fallback,
        seed,
        ..CoordinatorConfig::default()
    };

    let mut observers: Vec<Box<dyn CoordinationObserver>> = vec![Box::new(TracingObserver)];
    if let Some(folder) = tracks_folder {
        observers.push(Box::new(TrackFile::new(folder)));
    }
    let mut coordinator =
        Coordinator::new(config, Arc::new(planner)).with_observer(Box::new(CompositeObserver::new(observers)));

    let agent_config = AgentConfig {
        distance_threshold: threshold,
        ..AgentConfig::default()
    };
    let arena = BeliefArena::new();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut agents = scenario
        .build_models(&params)?
        .into_iter()
        .zip(&scenario.agents)
        .enumerate()
        .map(|(i, (model, spec))| {
            Agent::new(i, spec.name, model, agent_config.clone(), Some(arena.clone()), &mut rng)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut successful_runs = 0;
    let mut failed_runs = 0;
    let mut collisions = 0;
    for episode in 0..episodes {
        match coordinator.run_episode(&mut agents, max_steps) {
            Ok(report) => {
                collisions += report.collisions;
                tracing::debug!("Episode {}: {} beliefs live", episode + 1, arena.live());
                if report.all_reached_goal() {
                    successful_runs += 1;
                } else {
                    failed_runs += 1;
                }
            }
            Err(e) => {
                tracing::error!("Episode {} failed: {}", episode + 1, e);
                failed_runs += 1;
            }
        }
    }

    tracing::info!(
        "{} episodes: {} successful, {} failed, {} collisions",
        episodes,
        successful_runs,
        failed_runs,
        collisions
    );
    Ok(())
}
