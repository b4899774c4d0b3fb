//! Loading configuration documents from YAML or JSON.

use super::app::AppSpec;
use super::spec::PipelineSpec;
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// A configuration document: named pipelines plus optional named apps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocument {
    /// Pipelines keyed by name.
    pub pipelines: BTreeMap<String, PipelineSpec>,
    /// Apps keyed by name.
    #[serde(default)]
    pub apps: BTreeMap<String, AppSpec>,
}

impl ConfigDocument {
    /// Creates an empty document.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a pipeline.
    #[must_use]
    pub fn with_pipeline(mut self, name: impl Into<String>, spec: PipelineSpec) -> Self {
        self.pipelines.insert(name.into(), spec);
        self
    }

    /// Adds an app.
    #[must_use]
    pub fn with_app(mut self, name: impl Into<String>, app: AppSpec) -> Self {
        self.apps.insert(name.into(), app);
        self
    }

    /// Parses a pipeline document (pipeline name to definition) from YAML.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the text does not match the schema, or
    /// [`ConfigError::DuplicateComponent`] if a pipeline repeats an identity.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let pipelines: Option<BTreeMap<String, PipelineSpec>> = serde_yaml::from_str(text)?;
        Self::validated(pipelines.unwrap_or_default())
    }

    /// Parses a pipeline document from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Json`] if the text does not match the schema, or
    /// [`ConfigError::DuplicateComponent`] if a pipeline repeats an identity.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let pipelines: BTreeMap<String, PipelineSpec> = serde_json::from_str(text)?;
        Self::validated(pipelines)
    }

    /// Reads a pipeline document, choosing the format from the extension.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read and
    /// [`ConfigError::UnsupportedFormat`] for unknown extensions.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let doc = match Format::of(path)? {
            Format::Yaml => Self::from_yaml_str(&read(path)?)?,
            Format::Json => Self::from_json_str(&read(path)?)?,
        };
        debug!(path = %path.display(), pipelines = doc.pipelines.len(), "Loaded pipeline document");
        Ok(doc)
    }

    /// Adds the apps of an app document (app name to agent list) in YAML.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the text does not match the schema.
    pub fn with_apps_yaml_str(mut self, text: &str) -> Result<Self, ConfigError> {
        let apps: Option<BTreeMap<String, AppSpec>> = serde_yaml::from_str(text)?;
        self.apps.extend(apps.unwrap_or_default());
        Ok(self)
    }

    /// Adds the apps of an app document read from disk.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn with_apps_from_path(mut self, path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = read(path)?;
        let apps: BTreeMap<String, AppSpec> = match Format::of(path)? {
            Format::Yaml => serde_yaml::from_str::<Option<_>>(&text)?.unwrap_or_default(),
            Format::Json => serde_json::from_str(&text)?,
        };
        self.apps.extend(apps);
        Ok(self)
    }

    /// Looks up a pipeline by name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownPipeline`] if it does not exist.
    pub fn pipeline(&self, name: &str) -> Result<&PipelineSpec, ConfigError> {
        self.pipelines
            .get(name)
            .ok_or_else(|| ConfigError::UnknownPipeline(name.to_string()))
    }

    /// Looks up an app by name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownApp`] if it does not exist.
    pub fn app(&self, name: &str) -> Result<&AppSpec, ConfigError> {
        self.apps.get(name).ok_or_else(|| ConfigError::UnknownApp(name.to_string()))
    }

    /// Returns the pipeline names in sorted order.
    pub fn pipeline_names(&self) -> impl Iterator<Item = &str> {
        self.pipelines.keys().map(String::as_str)
    }

    fn validated(pipelines: BTreeMap<String, PipelineSpec>) -> Result<Self, ConfigError> {
        for (name, spec) in &pipelines {
            spec.validate(name)?;
        }
        Ok(Self {
            pipelines,
            apps: BTreeMap::new(),
        })
    }
}

enum Format {
    Yaml,
    Json,
}

impl Format {
    fn of(path: &Path) -> Result<Self, ConfigError> {
        let ext = path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("yaml" | "yml") => Ok(Self::Yaml),
            Some("json") => Ok(Self::Json),
            _ => Err(ConfigError::UnsupportedFormat {
                path: path.to_path_buf(),
            }),
        }
    }
}

fn read(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const DOC: &str = r"
embedding:
  excute_path: OpenAiStyleEmbeddings
  converter:
  components:
    - name: OpenAiStyleEmbeddings
      param:
        model: bge
add_text_vector:
  excute_path: TextSplitter-ChromaUpsertStore
  converter:
    - name: embedding_func
      type: instance
      value: OpenAiStyleEmbeddings
  components:
    - name: TextSplitter
    - name: OpenAiStyleEmbeddings
    - name: ChromaUpsertStore
      param:
        embedding_func:
";

    #[test]
    fn test_from_yaml_str() {
        let doc = ConfigDocument::from_yaml_str(DOC).unwrap();
        let names: Vec<&str> = doc.pipeline_names().collect();
        assert_eq!(names, vec!["add_text_vector", "embedding"]);
        assert!(doc.pipeline("embedding").unwrap().converters.is_empty());
        assert!(matches!(doc.pipeline("nope"), Err(ConfigError::UnknownPipeline(_))));
    }

    #[test]
    fn test_from_json_str() {
        let doc = ConfigDocument::from_json_str(
            r#"{"p": {"excute_path": "A", "components": [{"name": "A", "param": {"x": 1}}]}}"#,
        )
        .unwrap();
        assert_eq!(doc.pipeline("p").unwrap().components.len(), 1);
    }

    #[test]
    fn test_from_path_by_extension() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(DOC.as_bytes()).unwrap();

        let doc = ConfigDocument::from_path(file.path()).unwrap();
        assert_eq!(doc.pipelines.len(), 2);
    }

    #[test]
    fn test_unsupported_extension() {
        let file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        let err = ConfigDocument::from_path(file.path()).unwrap_err();
        assert_eq!(err.error_info().code, "CONFIG-FORMAT");
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConfigDocument::from_path(dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_apps_document() {
        let doc = ConfigDocument::from_yaml_str(DOC)
            .unwrap()
            .with_apps_yaml_str(
                r"
rag:
  - agent_name: embedding
    run_order: 1
    result_name: vector
  - agent_name: add_text_vector
",
            )
            .unwrap();

        assert_eq!(doc.app("rag").unwrap().agents.len(), 2);
        assert!(matches!(doc.app("other"), Err(ConfigError::UnknownApp(_))));
    }

    #[test]
    fn test_duplicate_component_rejected_on_load() {
        let err = ConfigDocument::from_yaml_str(
            r"
p:
  excute_path: A
  components:
    - name: A
    - name: a
",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateComponent { .. }));
    }
}
