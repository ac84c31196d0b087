use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use log::info;
use loan_collapse::{
    CollapseConfig, CollapsePlan, LinkageLookup, LinkageMap, NoLinkage, ParquetSource, ParquetTarget, Pipeline,
    SourceSchema, loan_schema,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Setup logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Some(config_path) = std::env::args().nth(1).map(PathBuf::from) else {
        bail!("usage: loan-collapse <config.json>");
    };
    let config = CollapseConfig::load(&config_path)
        .with_context(|| format!("Failed to load configuration {}", config_path.display()))?;
    info!("Configuration: {config}");

    let schema = match &config.schema {
        Some(path) => SourceSchema::load(path)
            .with_context(|| format!("Failed to load field declarations {}", path.display()))?,
        None => loan_schema(),
    };
    let plan = CollapsePlan::compile(schema).context("Invalid field declarations")?;
    log::debug!("Output columns:\n{}", plan.output().catalog());

    let linkage: Arc<dyn LinkageLookup> = match &config.linkage {
        Some(path) => Arc::new(
            load_linkage(path)
                .await
                .with_context(|| format!("Failed to load refinance map {}", path.display()))?,
        ),
        None => Arc::new(NoLinkage),
    };

    let source = ParquetSource::new(&config.source, plan.source().clone());
    let target = ParquetTarget::new(&config.target);
    let mut pipeline = Pipeline::new(config, plan, Arc::new(source), Arc::new(target)).with_linkage(linkage);
    let report = pipeline.run().await.context("Collapse run failed")?;

    for shard in &report.shards {
        info!(
            "Shard {}: {} loans, {} rows, {} batches",
            shard.shard, shard.entities, shard.observations, shard.batches
        );
    }
    info!(
        "Wrote {} records for {} loans in {:?}",
        report.records(),
        report.entities,
        report.elapsed
    );
    Ok(())
}

async fn load_linkage(path: &Path) -> loan_collapse::Result<LinkageMap> {
    if path.extension().is_some_and(|ext| ext == "parquet") {
        LinkageMap::from_parquet(path).await
    } else {
        LinkageMap::from_delimited(path)
    }
}
