//! Scenario resolution for the CLI.
//!
//! Specs name either a builtin scenario (`demo:log`) or a JSON scenario
//! file under the scenarios directory.  The file format composes builtin
//! journeys with datapools and volume models; there is no dynamic code
//! loading.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;

use stampede_datapool::{
    FileDatapool, IterableDatapool, RecyclableDatapool, RecyclableFileDatapool,
};
use stampede_node::{JourneyFn, ResolveError, ResolvedScenario, ScenarioResolver};
use stampede_types::{
    Journey, Scenario, SharedDatapool, VolumeModel, DEFAULT_DELAY_SECS, DEFAULT_INTERVAL_SECS,
    DEFAULT_JOURNEY_SEPARATION_SECS,
};

use crate::journeys;

#[derive(Deserialize)]
struct ScenarioFile {
    journeys: Vec<JourneyEntry>,
    #[serde(default = "default_interval")]
    interval: u64,
    #[serde(default = "default_delay")]
    delay: u64,
    #[serde(default = "default_separation")]
    journey_separation: f64,
}

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_SECS
}

fn default_delay() -> u64 {
    DEFAULT_DELAY_SECS
}

fn default_separation() -> f64 {
    DEFAULT_JOURNEY_SEPARATION_SECS
}

#[derive(Deserialize)]
struct JourneyEntry {
    /// Journey label in metrics; defaults to `builtin:<kind>#<index>`.
    #[serde(default)]
    name: Option<String>,
    #[serde(flatten)]
    kind: JourneyKind,
    #[serde(default)]
    datapool: Option<DatapoolSpec>,
    volume: VolumeModel,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum JourneyKind {
    HttpGet { url: String },
    Log {
        #[serde(default)]
        message: Option<String>,
    },
}

impl JourneyKind {
    fn label(&self) -> &'static str {
        match self {
            JourneyKind::HttpGet { .. } => "http_get",
            JourneyKind::Log { .. } => "log",
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DatapoolSpec {
    Inline {
        items: Vec<String>,
        #[serde(default)]
        recyclable: bool,
    },
    File {
        file: PathBuf,
        #[serde(default)]
        recyclable: bool,
    },
}

/// Resolves scenario specs against the scenarios directory and the builtin
/// journey registry.
pub struct RegistryResolver {
    scenarios_dir: Option<PathBuf>,
    client: reqwest::Client,
}

impl RegistryResolver {
    pub fn new(scenarios_dir: Option<PathBuf>) -> Self {
        RegistryResolver {
            scenarios_dir,
            client: reqwest::Client::new(),
        }
    }

    fn scenario_path(&self, spec: &str) -> PathBuf {
        let path = Path::new(spec);
        if path.is_absolute() {
            return path.to_path_buf();
        }
        match &self.scenarios_dir {
            Some(dir) => dir.join(path),
            None => path.to_path_buf(),
        }
    }

    fn load_file(&self, spec: &str) -> Result<ResolvedScenario, ResolveError> {
        let path = self.scenario_path(spec);
        let contents = std::fs::read_to_string(&path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                ResolveError::UnknownSpec(spec.to_string())
            } else {
                ResolveError::Invalid {
                    spec: spec.to_string(),
                    reason: err.to_string(),
                }
            }
        })?;
        let file: ScenarioFile =
            serde_json::from_str(&contents).map_err(|err| ResolveError::Invalid {
                spec: spec.to_string(),
                reason: err.to_string(),
            })?;
        self.build(spec, file, path.parent())
    }

    fn build(
        &self,
        spec: &str,
        file: ScenarioFile,
        base_dir: Option<&Path>,
    ) -> Result<ResolvedScenario, ResolveError> {
        if !(file.journey_separation > 0.0) || file.interval == 0 {
            return Err(ResolveError::Invalid {
                spec: spec.to_string(),
                reason: "interval and journey_separation must be positive".to_string(),
            });
        }
        let mut journeys = Vec::with_capacity(file.journeys.len());
        let mut journey_fns: HashMap<String, JourneyFn> = HashMap::new();

        for (index, entry) in file.journeys.into_iter().enumerate() {
            validate_volume(spec, &entry.volume)?;
            let journey_spec = entry
                .name
                .unwrap_or_else(|| format!("builtin:{}#{index}", entry.kind.label()));
            let journey_fn = match &entry.kind {
                JourneyKind::HttpGet { url } => {
                    journeys::http_get(self.client.clone(), url.clone())
                }
                JourneyKind::Log { message } => journeys::log_line(
                    message.clone().unwrap_or_else(|| "journey executed".to_string()),
                ),
            };
            let datapool = entry
                .datapool
                .map(|pool| build_datapool(spec, pool, base_dir))
                .transpose()?;
            journey_fns.insert(journey_spec.clone(), journey_fn);
            journeys.push(Journey::new(journey_spec, datapool, entry.volume));
        }

        Ok(ResolvedScenario {
            scenario: Scenario {
                journeys,
                interval: file.interval,
                delay: file.delay,
                journey_separation: file.journey_separation,
            },
            journeys: journey_fns,
        })
    }

    /// A file-less scenario for wiring checks: one log journey, one line a
    /// second for a minute.
    fn demo_log(&self) -> ResolvedScenario {
        let journey_spec = "builtin:log#0".to_string();
        let mut journey_fns: HashMap<String, JourneyFn> = HashMap::new();
        journey_fns.insert(
            journey_spec.clone(),
            journeys::log_line("demo journey executed".to_string()),
        );
        ResolvedScenario {
            scenario: Scenario::new(vec![Journey::new(
                journey_spec,
                None,
                VolumeModel::constant(1, Some(60)),
            )])
            .with_interval(5)
            .with_delay(5),
            journeys: journey_fns,
        }
    }
}

impl ScenarioResolver for RegistryResolver {
    fn resolve(&self, spec: &str) -> Result<ResolvedScenario, ResolveError> {
        match spec {
            "demo:log" => Ok(self.demo_log()),
            _ => self.load_file(spec),
        }
    }
}

fn validate_volume(spec: &str, volume: &VolumeModel) -> Result<(), ResolveError> {
    if let VolumeModel::Dynamic {
        duration: None,
        ramp_down: Some(_),
        ..
    } = volume
    {
        return Err(ResolveError::Invalid {
            spec: spec.to_string(),
            reason: "ramp_down requires a duration".to_string(),
        });
    }
    Ok(())
}

fn build_datapool(
    spec: &str,
    pool: DatapoolSpec,
    base_dir: Option<&Path>,
) -> Result<SharedDatapool, ResolveError> {
    match pool {
        DatapoolSpec::Inline { items, recyclable } => {
            if recyclable {
                Ok(Arc::new(Mutex::new(RecyclableDatapool::new(items))))
            } else {
                Ok(Arc::new(Mutex::new(IterableDatapool::new(items))))
            }
        }
        DatapoolSpec::File { file, recyclable } => {
            let path = if file.is_absolute() {
                file
            } else {
                base_dir.map(|dir| dir.join(&file)).unwrap_or(file)
            };
            let invalid = |err: stampede_datapool::DatapoolError| ResolveError::Invalid {
                spec: spec.to_string(),
                reason: err.to_string(),
            };
            if recyclable {
                Ok(Arc::new(Mutex::new(
                    RecyclableFileDatapool::new(&path).map_err(invalid)?,
                )))
            } else {
                Ok(Arc::new(Mutex::new(FileDatapool::new(&path).map_err(invalid)?)))
            }
        }
    }
}
