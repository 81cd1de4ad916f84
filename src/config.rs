//! Pipeline configuration (§6.5): the options every pass reads, carried
//! as an explicit struct rather than global state or parsed flags — CLI
//! wiring is out of scope, but the options themselves are real, just as
//! the teacher threads a `Flags`/`Context`-held options struct through
//! `cranelift-codegen` rather than consulting globals from inside a pass.

use crate::bus::BusFormat;
use std::env;
use std::str::FromStr;

/// Options read by the converge/mem-to-req/liveness/flatten-cfg/pipeline
/// passes (§6.5).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Emit a summary of Converge's merge potential.
    pub converge_stats: bool,
    /// Emit per-split live-state sizes from Pipeline.
    pub pipeline_stats: bool,
    /// Allow Flatten-CFG to speculate packet/map reads under false
    /// predicates (§4.5).
    pub flatten_spec_reads: bool,
    /// Emit diagnostic dumps of analysis results.
    pub print_analysis_info: bool,
    pub bus: BusFormat,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            converge_stats: false,
            pipeline_stats: false,
            flatten_spec_reads: false,
            print_analysis_info: false,
            bus: BusFormat::Sb,
        }
    }
}

impl PipelineConfig {
    /// Reads matching `NANOTUBE_*` environment variables over the
    /// defaults, for manual driving and test setups. Never consults
    /// `argv` (CLI parsing is out of scope, §1 Non-goals).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.converge_stats = env_flag("NANOTUBE_CONVERGE_STATS", config.converge_stats);
        config.pipeline_stats = env_flag("NANOTUBE_PIPELINE_STATS", config.pipeline_stats);
        config.flatten_spec_reads =
            env_flag("NANOTUBE_FLATTEN_SPEC_READS", config.flatten_spec_reads);
        config.print_analysis_info =
            env_flag("NANOTUBE_PRINT_ANALYSIS_INFO", config.print_analysis_info);
        if let Ok(bus) = env::var("NANOTUBE_BUS") {
            match BusFormat::from_str(bus.trim()) {
                Ok(bus) => config.bus = bus,
                Err(err) => log::warn!("NANOTUBE_BUS: {err}, keeping default {:?}", config.bus),
            }
        }
        config
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => matches!(v.trim(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_conservative() {
        let config = PipelineConfig::default();
        assert!(!config.converge_stats);
        assert!(!config.flatten_spec_reads);
        assert_eq!(config.bus, BusFormat::Sb);
    }
}
