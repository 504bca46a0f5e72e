// src/main.rs
use std::env;
use std::path::Path;

use anyhow::{Context, Result};
use log::{info, warn};

use eis_engine::drivers::connect;
use eis_engine::status::JsonStatusFile;
use eis_engine::{run_measurement, EngineConfig, RunContext, RunParameters};

// 默认设备: U2331A
const DEFAULT_RESOURCE: &str = "USB0::0x0957::0x1518::TW57160002::0::INSTR";

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn load_config(path: &str) -> Result<EngineConfig> {
    if Path::new(path).exists() {
        EngineConfig::from_json_file(path).with_context(|| format!("reading {path}"))
    } else {
        warn!("{path} not found, using built-in defaults");
        Ok(EngineConfig::default())
    }
}

// 入口函数
fn main() -> Result<()> {
    env_logger::init();
    let params_path = var_or("EIS_PARAMETERS", "eis_parameters.json");
    let config_path = var_or("EIS_CONFIG", "eis_config.json");
    let resource = var_or("EIS_RESOURCE", DEFAULT_RESOURCE);
    let status_path = var_or("EIS_STATUS", JsonStatusFile::DEFAULT_NAME);

    let config = load_config(&config_path)?;
    let params = RunParameters::from_json_file(&params_path)
        .with_context(|| format!("reading run parameters from {params_path}"))?;
    let (mut channel, identity) =
        connect(&resource).with_context(|| format!("connecting to {resource}"))?;
    info!("instrument: {identity}");

    let mut status = JsonStatusFile::new(status_path);
    let ctx = RunContext::new(&config, &params);
    let report = run_measurement(&mut channel, &ctx, &mut status).context("measurement failed")?;
    for m in &report.measurements {
        for point in &m.extraction.impedance {
            info!(
                "rep {} f={:.3} Hz Z={:.6}{:+.6}j",
                m.repetition, point.frequency_hz, point.real, point.imag
            );
        }
    }
    info!(
        "{} repetition(s) written to {}",
        report.completed,
        config.output_dir.display()
    );
    Ok(())
}
