use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::model::ModelError;

/// Settings of the external beam code, read from the `[beam]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BeamConfig {
    /// Input template containing the `@F @E @L @I` tokens.
    #[serde(default = "default_template")]
    pub template: PathBuf,
    /// Command line run inside each work dir.
    #[serde(default = "default_command", alias = "executable")]
    pub command: String,
    /// Directory that receives the per-evaluation work dirs.
    #[serde(default)]
    pub work_root: Option<PathBuf>,
    /// Work dir name prefix.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Keep work dirs after evaluation for debugging.
    #[serde(default)]
    pub keep_workdirs: bool,
    /// Intentional delay before each evaluation, in milliseconds.
    #[serde(default)]
    pub sleep_ms: u64,
    /// Output file written by the code.
    #[serde(default = "default_output_file")]
    pub output_file: String,
    /// Named execution sites overriding `work_root`.
    #[serde(default)]
    pub sites: BTreeMap<String, SiteConfig>,
}

/// An execution site, e.g. a cluster with its own scratch space.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SiteConfig {
    /// Scratch directory on this site.
    pub work_root: PathBuf,
}

fn default_template() -> PathBuf {
    PathBuf::from("beam_input_template.xml")
}

fn default_command() -> String {
    "beam -x beam.xml".into()
}

fn default_prefix() -> String {
    "simwrap-beam-".into()
}

fn default_output_file() -> String {
    "_beam_outputs_.xml".into()
}

impl Default for BeamConfig {
    fn default() -> Self {
        Self {
            template: default_template(),
            command: default_command(),
            work_root: None,
            prefix: default_prefix(),
            keep_workdirs: false,
            sleep_ms: 0,
            output_file: default_output_file(),
            sites: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BeamDocument {
    beam: Option<BeamConfig>,
}

impl BeamConfig {
    /// Parses the `[beam]` table of a TOML document, if present.
    pub fn from_toml_str(raw: &str) -> Result<Option<Self>> {
        let document: BeamDocument = toml::from_str(raw).context("parsing [beam] table")?;
        document.beam.map(Self::validated).transpose()
    }

    /// Loads the `[beam]` table of a TOML file, resolving relative paths
    /// against the file's directory. Returns `None` when the table is absent.
    pub fn load(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading beam config {}", path.display()))?;
        let document: BeamDocument =
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        let Some(config) = document.beam else {
            return Ok(None);
        };
        let mut config = config.validated()?;
        let source_dir = path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let resolve = |candidate: &mut PathBuf| {
            if candidate.is_relative() {
                *candidate = source_dir.join(&*candidate);
            }
        };
        resolve(&mut config.template);
        if let Some(root) = config.work_root.as_mut() {
            resolve(root);
        }
        config
            .sites
            .values_mut()
            .for_each(|site| resolve(&mut site.work_root));
        Ok(Some(config))
    }

    fn validated(self) -> Result<Self> {
        if self.command.trim().is_empty() {
            bail!("beam.command must not be empty");
        }
        if self.output_file.trim().is_empty() {
            bail!("beam.output_file must not be empty");
        }
        Ok(self)
    }

    /// Work root for `site`, falling back to `work_root` and then to the
    /// system temporary directory.
    pub fn work_root_for(&self, site: Option<&str>) -> Result<PathBuf, ModelError> {
        match site {
            Some(name) => self
                .sites
                .get(name)
                .map(|site| site.work_root.clone())
                .ok_or_else(|| ModelError::UnknownSite(name.to_owned())),
            None => Ok(self
                .work_root
                .clone()
                .unwrap_or_else(std::env::temp_dir)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_table_is_none() {
        assert!(BeamConfig::from_toml_str("[evaluator]\nn_jobs = 2\n")
            .unwrap()
            .is_none());
    }

    #[test]
    fn load_resolves_paths_and_sites() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("simwrap.toml");
        fs::write(
            &path,
            r#"
            [beam]
            template = "templates/beam.xml"
            executable = "./beam -x beam.xml"
            sleep_ms = 5

            [beam.sites.cluster]
            work_root = "scratch"
            "#,
        )
        .unwrap();
        let config = BeamConfig::load(&path).unwrap().unwrap();
        assert_eq!(config.template, dir.path().join("templates/beam.xml"));
        assert_eq!(config.command, "./beam -x beam.xml");
        assert_eq!(config.output_file, "_beam_outputs_.xml");
        assert_eq!(
            config.work_root_for(Some("cluster")).unwrap(),
            dir.path().join("scratch")
        );
        assert_eq!(config.work_root_for(None).unwrap(), std::env::temp_dir());
        assert!(matches!(
            config.work_root_for(Some("laptop")),
            Err(ModelError::UnknownSite(_))
        ));
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(BeamConfig::from_toml_str("[beam]\ncommand = \"  \"\n").is_err());
    }
}
