//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use crate::DatasetAction;
use deepseis_core::{ExperimentConfig, RunContext};
use deepseis_ml::augment::AugmentationPipeline;
use deepseis_ml::training::{RunSummary, open_split};
use deepseis_ml::{Experiment, ModelRegistry, PatchDataset, PatchOptions};

/// Handle a CLI subcommand. `config` is loaded whenever the command takes `--cfg`.
pub async fn handle_command(
    command: Commands,
    config: Option<ExperimentConfig>,
) -> anyhow::Result<()> {
    match command {
        Commands::Train { .. } => handle_train(require(config)?).await,
        Commands::Config { action } => handle_config(action, require(config)?),
        Commands::Dataset { action } => handle_dataset(action, require(config)?),
        Commands::Models => handle_models(),
    }
}

fn require(config: Option<ExperimentConfig>) -> anyhow::Result<ExperimentConfig> {
    config.ok_or_else(|| anyhow::anyhow!("this command needs --cfg"))
}

async fn handle_train(config: ExperimentConfig) -> anyhow::Result<()> {
    let context = RunContext::from_config(&config);
    let registry = ModelRegistry::builtin();
    let experiment = Experiment::prepare(config, context, &registry)?;
    let run_id = experiment.record().id.clone();

    let summary = tokio::select! {
        result = experiment.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!(run = %run_id, "Interrupted, stopping training");
            anyhow::bail!("training interrupted");
        }
    };
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    let record = &summary.record;
    println!("Run {} finished", record.id);
    println!("  Model:       {}", record.model);
    println!("  Epochs:      {}", record.epochs_completed);
    println!("  Iterations:  {}", record.iterations);
    if let Some(loss) = record.final_loss {
        println!("  Final loss:  {loss:.6}");
    }
    if let (Some(miou), Some(epoch)) = (record.best_miou, record.best_epoch) {
        println!("  Best mIoU:   {miou:.4} (epoch {epoch})");
    }
    if summary.checkpoints.is_empty() {
        println!("  No snapshots written");
    } else {
        println!("  Snapshots:");
        for cp in &summary.checkpoints {
            println!("    {} (mIoU {:.4})", cp.path.display(), cp.miou);
        }
    }
}

fn handle_config(action: ConfigAction, config: ExperimentConfig) -> anyhow::Result<()> {
    match action {
        ConfigAction::Check { config: args } => {
            let train = &config.train;
            println!("Configuration OK: {}", args.cfg.display());
            println!("  Model:      {}", config.model.name);
            println!("  Classes:    {}", config.dataset.num_classes);
            println!(
                "  Patches:    {}px, stride {}, depth {:?}",
                train.patch_size, train.stride, train.depth
            );
            println!(
                "  Epochs:     {}..{}, lr {} -> {}, restart every {} epochs",
                train.begin_epoch,
                train.end_epoch,
                train.max_lr,
                train.min_lr,
                train.scheduler_step()
            );
            println!(
                "  Pipeline:   {}",
                AugmentationPipeline::from_config(train, true)?.describe()
            );
            if !ModelRegistry::builtin().contains(&config.model.name) {
                anyhow::bail!("unknown model '{}'", config.model.name);
            }
            Ok(())
        }
        ConfigAction::Show { .. } => {
            print!("{}", config.to_yaml()?);
            Ok(())
        }
    }
}

fn handle_dataset(action: DatasetAction, config: ExperimentConfig) -> anyhow::Result<()> {
    match action {
        DatasetAction::Inspect { split, .. } => {
            let context = RunContext::from_config(&config);
            let datasets: Vec<(String, PatchDataset)> = match split {
                Some(name) => {
                    let training = name == "train";
                    let dataset = PatchDataset::open(
                        &config.dataset.root,
                        &name,
                        &config,
                        PatchOptions::from_config(&config, training),
                        AugmentationPipeline::from_config(&config.train, training)?,
                        context.component_seed(&name),
                    )?;
                    vec![(name, dataset)]
                }
                None => vec![
                    ("train".to_string(), open_split(&config, &context, true)?),
                    ("val".to_string(), open_split(&config, &context, false)?),
                ],
            };

            println!("Dataset: {}", config.dataset.root.display());
            for (name, dataset) in &datasets {
                println!(
                    "  {:<8} {:>5} slices {:>8} patches  [{}]",
                    name,
                    dataset.num_slices(),
                    dataset.len(),
                    dataset.transform().describe()
                );
            }
            Ok(())
        }
    }
}

fn handle_models() -> anyhow::Result<()> {
    println!("Registered models:");
    for name in ModelRegistry::builtin().names() {
        println!("  {name}");
    }
    Ok(())
}
