//! Run settings.
//!
//! Precedence, highest first: command-line flags, `QREP_*` environment
//! variables, the YAML file given with `--config`, built-in defaults.
//!
//! `p_gen`, `w0` and `t_coh` take either one value for every link or a list
//! with one value per link, e.g. `--t_coh 400,20,400` on a four-node chain.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use qrep_sim::{
    BackendKind, EngineConfig, GenerationParams, PhysicalParams, ProtocolSpec, TruncationMode,
    suggest_truncation,
};
use serde::{Deserialize, Serialize};

/// A per-link parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LinkValues {
    /// The same value on every link.
    Uniform(f64),
    /// One value per link, left to right.
    PerLink(Vec<f64>),
}

impl From<f64> for LinkValues {
    fn from(v: f64) -> Self {
        Self::Uniform(v)
    }
}

impl FromStr for LinkValues {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let values = s
            .split(',')
            .map(|v| v.trim().parse::<f64>().map_err(|e| format!("'{}': {e}", v.trim())))
            .collect::<Result<Vec<_>, _>>()?;
        match values.as_slice() {
            [] => Err("expected a number or a comma-separated list".into()),
            [v] => Ok(Self::Uniform(*v)),
            _ => Ok(Self::PerLink(values)),
        }
    }
}

impl fmt::Display for LinkValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uniform(v) => write!(f, "{v}"),
            Self::PerLink(values) => {
                let parts: Vec<String> = values.iter().map(f64::to_string).collect();
                write!(f, "{}", parts.join(","))
            }
        }
    }
}

impl LinkValues {
    pub fn is_uniform(&self) -> bool {
        matches!(self, Self::Uniform(_))
    }

    /// One value per link; a list must have exactly `links` entries.
    pub fn per_link(&self, name: &str, links: usize) -> Result<Vec<f64>> {
        match self {
            Self::Uniform(v) => Ok(vec![*v; links]),
            Self::PerLink(values) if values.len() == links => Ok(values.clone()),
            Self::PerLink(values) => bail!(
                "{name} lists {} values, but a chain of {} nodes has {links} links",
                values.len(),
                links + 1
            ),
        }
    }

    /// Smallest value.
    pub fn min(&self) -> f64 {
        match self {
            Self::Uniform(v) => *v,
            Self::PerLink(values) => values.iter().copied().fold(f64::INFINITY, f64::min),
        }
    }

    /// Largest value.
    pub fn max(&self) -> f64 {
        match self {
            Self::Uniform(v) => *v,
            Self::PerLink(values) => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        }
    }
}

/// Split a step list such as `s1,s0` or `d0 s0`.
pub fn parse_steps(raw: &str) -> Vec<String> {
    raw.split([',', ' '])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Everything needed to build and evaluate one chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Number of repeater nodes, end nodes included.
    pub nodes: usize,
    /// Distillation rounds on every elementary link, or the most rounds
    /// per swap input when searching protocol structures.
    pub max_dists: u32,
    pub t_coh: LinkValues,
    pub p_gen: LinkValues,
    pub p_swap: f64,
    pub w0: LinkValues,
    /// Explicit protocol in step encoding; replaces the balanced chain.
    pub protocol_steps: Option<Vec<String>>,
    /// Horizon; derived from the parameters when absent.
    pub truncation: Option<usize>,
    pub backend: BackendKind,
    /// Reference backend for numerical cross-checks.
    pub cross_check: Option<BackendKind>,
    pub truncation_tolerance: f64,
    /// Grow the horizon until the lost mass is within tolerance.
    pub adaptive: bool,
}

impl Default for Settings {
    fn default() -> Self {
        let physics = PhysicalParams::default();
        Self {
            nodes: 3,
            max_dists: 0,
            t_coh: physics.t_coh.into(),
            p_gen: physics.p_gen.into(),
            p_swap: physics.p_swap,
            w0: physics.w0.into(),
            protocol_steps: None,
            truncation: None,
            backend: BackendKind::default(),
            cross_check: None,
            truncation_tolerance: EngineConfig::default().truncation_tolerance,
            adaptive: false,
        }
    }
}

/// Values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub nodes: Option<usize>,
    pub max_dists: Option<u32>,
    pub t_coh: Option<LinkValues>,
    pub p_gen: Option<LinkValues>,
    pub p_swap: Option<f64>,
    pub w0: Option<LinkValues>,
    pub protocol_steps: Option<Vec<String>>,
    pub truncation: Option<usize>,
    pub backend: Option<BackendKind>,
}

impl Settings {
    /// Load a YAML file over the defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_yaml_ng::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Resolve all layers and validate the result.
    pub fn load(
        config_file: Option<&Path>,
        overrides: &Overrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let settings = match config_file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let settings = settings.merge_env(env)?.merge_overrides(overrides);
        settings.validate()?;
        Ok(settings)
    }

    /// Apply the `QREP_*` variables that are set.
    pub fn merge_env(mut self, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        fn parse<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            raw.trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid value for {name}: '{raw}' ({e})"))
        }

        if let Some(v) = env("QREP_NODES") {
            self.nodes = parse("QREP_NODES", &v)?;
        }
        if let Some(v) = env("QREP_MAX_DISTS") {
            self.max_dists = parse("QREP_MAX_DISTS", &v)?;
        }
        if let Some(v) = env("QREP_T_COH") {
            self.t_coh = parse("QREP_T_COH", &v)?;
        }
        if let Some(v) = env("QREP_P_GEN") {
            self.p_gen = parse("QREP_P_GEN", &v)?;
        }
        if let Some(v) = env("QREP_P_SWAP") {
            self.p_swap = parse("QREP_P_SWAP", &v)?;
        }
        if let Some(v) = env("QREP_W0") {
            self.w0 = parse("QREP_W0", &v)?;
        }
        if let Some(v) = env("QREP_PROTOCOL") {
            self.protocol_steps = Some(parse_steps(&v));
        }
        if let Some(v) = env("QREP_TRUNCATION") {
            self.truncation = Some(parse("QREP_TRUNCATION", &v)?);
        }
        if let Some(v) = env("QREP_BACKEND") {
            self.backend = parse("QREP_BACKEND", &v)?;
        }
        Ok(self)
    }

    /// Apply flags given on the command line.
    pub fn merge_overrides(mut self, o: &Overrides) -> Self {
        self.nodes = o.nodes.unwrap_or(self.nodes);
        self.max_dists = o.max_dists.unwrap_or(self.max_dists);
        self.t_coh = o.t_coh.clone().unwrap_or(self.t_coh);
        self.p_gen = o.p_gen.clone().unwrap_or(self.p_gen);
        self.p_swap = o.p_swap.unwrap_or(self.p_swap);
        self.w0 = o.w0.clone().unwrap_or(self.w0);
        self.protocol_steps = o.protocol_steps.clone().or(self.protocol_steps);
        self.truncation = o.truncation.or(self.truncation);
        self.backend = o.backend.unwrap_or(self.backend);
        self
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.nodes < 2 {
            bail!("nodes must be at least 2, got {}", self.nodes);
        }
        self.physical().validate()?;
        self.links()?;
        if self.protocol_steps.is_some() && self.max_dists > 0 {
            bail!("max_dists applies to the balanced chain; an explicit protocol lists its own distillations");
        }
        self.engine_config(2).validate()?;
        Ok(())
    }

    /// Number of elementary links.
    pub fn segments(&self) -> usize {
        self.nodes.saturating_sub(1)
    }

    /// Chain-wide parameters.
    ///
    /// With per-link lists these are the least favorable values: the
    /// smallest `p_gen` and `w0` and the largest `t_coh`. They size the
    /// horizon; every link carries its own values.
    pub fn physical(&self) -> PhysicalParams {
        PhysicalParams::new(self.p_gen.min(), self.p_swap, self.w0.min()).with_coherence_time(self.t_coh.max())
    }

    /// Per-link parameters, or `None` when every link uses the chain-wide
    /// values.
    pub fn links(&self) -> Result<Option<Vec<GenerationParams>>> {
        if self.p_gen.is_uniform() && self.w0.is_uniform() && self.t_coh.is_uniform() {
            return Ok(None);
        }
        let n = self.segments();
        let p_gen = self.p_gen.per_link("p_gen", n)?;
        let w0 = self.w0.per_link("w0", n)?;
        let t_coh = self.t_coh.per_link("t_coh", n)?;
        Ok(Some(
            (0..n)
                .map(|i| GenerationParams::new(p_gen[i], w0[i], t_coh[i]))
                .collect(),
        ))
    }

    /// Per-link parameters, with defaults where every link is the same.
    pub fn links_or_default(&self) -> Result<Vec<GenerationParams>> {
        Ok(self
            .links()?
            .unwrap_or_else(|| vec![GenerationParams::default(); self.segments()]))
    }

    /// The chain these settings describe: the explicit protocol if given,
    /// otherwise a balanced swap tree.
    pub fn protocol(&self) -> Result<ProtocolSpec> {
        if let Some(steps) = &self.protocol_steps {
            return ProtocolSpec::from_steps_with(&self.links_or_default()?, steps)
                .with_context(|| format!("Invalid protocol '{}'", steps.join(",")));
        }
        Ok(match self.links()? {
            Some(links) => ProtocolSpec::swap_chain_with(&links, self.max_dists)?,
            None => ProtocolSpec::swap_chain(self.nodes, self.max_dists)?,
        })
    }

    /// Engine settings, with `default_truncation` used when none is set.
    pub fn engine_config(&self, default_truncation: usize) -> EngineConfig {
        let truncation = self.truncation.unwrap_or(default_truncation).max(2);
        let mut config = EngineConfig::new(truncation)
            .with_backend(self.backend)
            .with_truncation_tolerance(self.truncation_tolerance)
            .with_truncation_mode(TruncationMode::Error);
        config.max_truncation = config.max_truncation.max(truncation);
        if let Some(reference) = self.cross_check {
            config = config.with_cross_check(reference);
        }
        config
    }

    /// Horizon for `spec`: the configured one, or a suggestion from the
    /// expected waiting time.
    pub fn truncation_for(&self, spec: &ProtocolSpec) -> usize {
        self.truncation
            .unwrap_or_else(|| suggest_truncation(&self.physical(), spec.swap_levels(), spec.distill_levels()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_defaults_validate() {
        let s = Settings::load(None, &Overrides::default(), |_| None).unwrap();
        assert_eq!(s, Settings::default());
        assert_eq!(s.physical(), PhysicalParams::default());
    }

    #[test]
    fn test_env_overrides_file_and_flags_override_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.yaml");
        std::fs::write(&path, "nodes: 5\np_gen: 0.3\nw0: 0.9\nbackend: fft\n").unwrap();

        let env = env_of(&[("QREP_P_GEN", "0.2"), ("QREP_W0", "0.97")]);
        let flags = Overrides {
            w0: Some(0.99.into()),
            ..Overrides::default()
        };
        let s = Settings::load(Some(&path), &flags, env).unwrap();
        assert_eq!(s.nodes, 5);
        assert_eq!(s.backend, BackendKind::Fft);
        assert_eq!(s.p_gen, LinkValues::Uniform(0.2));
        assert_eq!(s.w0, LinkValues::Uniform(0.99));
    }

    #[test]
    fn test_bad_values_are_rejected() {
        assert!(Settings::load(None, &Overrides::default(), env_of(&[("QREP_P_GEN", "lots")])).is_err());
        assert!(Settings::load(None, &Overrides::default(), env_of(&[("QREP_BACKEND", "gpu")])).is_err());
        let flags = Overrides {
            p_swap: Some(1.5),
            ..Overrides::default()
        };
        assert!(Settings::load(None, &flags, |_| None).is_err());
        let flags = Overrides {
            nodes: Some(1),
            ..Overrides::default()
        };
        assert!(Settings::load(None, &flags, |_| None).is_err());
    }

    #[test]
    fn test_unknown_yaml_keys_are_rejected() {
        assert!(serde_yaml_ng::from_str::<Settings>("nodez: 4\n").is_err());
        let s: Settings = serde_yaml_ng::from_str("t_coh: .inf\n").unwrap();
        assert!(s.t_coh.max().is_infinite());
    }

    #[test]
    fn test_link_lists_parse_and_broadcast() {
        assert_eq!("0.5".parse::<LinkValues>(), Ok(LinkValues::Uniform(0.5)));
        assert_eq!(
            " 0.5, 0.2 ".parse::<LinkValues>(),
            Ok(LinkValues::PerLink(vec![0.5, 0.2]))
        );
        assert!("0.5,,0.2".parse::<LinkValues>().is_err());
        assert_eq!(LinkValues::PerLink(vec![0.5, 0.2]).to_string(), "0.5,0.2");

        let env = env_of(&[("QREP_NODES", "4"), ("QREP_T_COH", "400,20,400")]);
        let s = Settings::load(None, &Overrides::default(), env).unwrap();
        let links = s.links().unwrap().unwrap();
        assert_eq!(links.len(), 3);
        assert_eq!(links[1].t_coh, Some(20.0));
        assert_eq!(links[1].p_gen, Some(s.physical().p_gen));
        assert_eq!(s.physical().t_coh, 400.0);

        let yaml: Settings = serde_yaml_ng::from_str("nodes: 3\np_gen: [0.5, 0.1]\n").unwrap();
        assert_eq!(yaml.physical().p_gen, 0.1);
        assert_eq!(
            yaml.protocol().unwrap().to_string(),
            "swap(gen(p=0.5, w0=0.95, t_coh=400), gen(p=0.1, w0=0.95, t_coh=400))"
        );
    }

    #[test]
    fn test_link_list_length_must_match_the_chain() {
        let flags = Overrides {
            nodes: Some(4),
            w0: Some("0.9,0.95".parse().unwrap()),
            ..Overrides::default()
        };
        let err = Settings::load(None, &flags, |_| None).unwrap_err();
        assert!(err.to_string().contains("w0 lists 2 values, but a chain of 4 nodes has 3 links"));
    }

    #[test]
    fn test_uniform_settings_keep_the_shared_chain() {
        let s = Settings::default();
        assert!(s.links().unwrap().is_none());
        assert_eq!(s.protocol().unwrap(), ProtocolSpec::swap_chain(3, 0).unwrap());
    }

    #[test]
    fn test_protocol_steps() {
        assert_eq!(parse_steps("s1, s0"), vec!["s1", "s0"]);
        assert_eq!(parse_steps("d0 s0"), vec!["d0", "s0"]);

        let flags = Overrides {
            nodes: Some(4),
            protocol_steps: Some(parse_steps("d2,s1,s0")),
            ..Overrides::default()
        };
        let s = Settings::load(None, &flags, |_| None).unwrap();
        assert_eq!(
            s.protocol().unwrap().to_string(),
            "swap(gen, swap(gen, distill(gen, gen)))"
        );

        let bad = Settings {
            protocol_steps: Some(parse_steps("s0")),
            ..s.clone()
        };
        assert!(bad.protocol().is_err());
        let flags = Overrides {
            max_dists: Some(1),
            ..flags
        };
        assert!(Settings::load(None, &flags, |_| None).is_err());
    }
}
