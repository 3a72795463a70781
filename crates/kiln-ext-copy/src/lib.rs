//! The builtin `copy` preset: copies static assets through a weighted
//! transform pipeline.

use std::collections::HashSet;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use kiln_core::bundle::split_pattern;
use kiln_core::pipeline::{assemble, PipelineBuilder, PipelineSlot, PluginContribution};
use kiln_core::{
    Backend, BuildContext, BuildOutcome, Bundle, Capability, ConfigFragment, Diagnostic, Error,
    Job, Preset, Result, RunnerTable, TaskDefinition,
};
use tracing::{debug, instrument};

pub const PRESET_NAME: &str = "copy";
pub const RUNNER: &str = "copy";

/// Categories the `copy` runner is offered for.
pub const CATEGORIES: [&str; 2] = ["images", "static"];

/// A byte transform applied to every copied file.
pub trait Transform: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn apply(&self, path: &Path, contents: Vec<u8>) -> Result<Vec<u8>>;
}

/// The plugin type of the `copy` backend pipeline.
pub type CopyTransform = Arc<dyn Transform>;

#[derive(Debug, Default)]
pub struct CopyPreset;

impl CopyPreset {
    pub fn new() -> Self {
        Self
    }
}

impl Preset for CopyPreset {
    fn name(&self) -> &str {
        PRESET_NAME
    }

    fn capabilities(&self) -> HashSet<Capability> {
        HashSet::from([
            Capability::DefaultConfig,
            Capability::BundleCreator,
            Capability::pipeline(RUNNER),
        ])
    }

    fn default_config(&self) -> ConfigFragment {
        ConfigFragment::new()
            .set("bundle_types.images", "images")
            .set("images.images.source", "images/**")
    }

    fn bundle_creator(&self, _ctx: &BuildContext, runners: &mut RunnerTable) {
        let backend: Arc<dyn Backend> = Arc::new(CopyBackend);
        for category in CATEGORIES {
            runners.add(category, RUNNER, Arc::clone(&backend));
        }
    }

    fn pipeline(&self, ctx: &BuildContext, bundle: &Bundle, slot: &mut PipelineSlot<'_>) {
        let Some(builder) = slot.builder::<CopyTransform>() else {
            return;
        };
        builder.insert(
            "normalize-eol",
            PluginContribution::new(|_| Ok(Arc::new(NormalizeEol) as CopyTransform)).weight(10),
        );

        let banner = bundle
            .extra_str("banner")
            .or_else(|| ctx.config().get_str("copy.banner"));
        if let Some(banner) = banner {
            builder.insert(
                "banner",
                PluginContribution::new(|options| {
                    let text = options
                        .get("text")
                        .and_then(toml::Value::as_str)
                        .unwrap_or_default();
                    Ok(Arc::new(Banner {
                        text: text.to_string(),
                    }) as CopyTransform)
                })
                .weight(90)
                .option("text", banner),
            );
        }
    }
}

/// Text files are valid UTF-8 without NUL bytes.
fn is_text(contents: &[u8]) -> bool {
    !contents.contains(&0) && std::str::from_utf8(contents).is_ok()
}

/// Rewrites `\r\n` line endings to `\n` in text files.
#[derive(Debug)]
struct NormalizeEol;

impl Transform for NormalizeEol {
    fn name(&self) -> &str {
        "normalize-eol"
    }

    fn apply(&self, _path: &Path, contents: Vec<u8>) -> Result<Vec<u8>> {
        if !is_text(&contents) || !contents.contains(&b'\r') {
            return Ok(contents);
        }
        let mut normalized = Vec::with_capacity(contents.len());
        let mut bytes = contents.iter().peekable();
        while let Some(&byte) = bytes.next() {
            if byte == b'\r' && bytes.peek() == Some(&&b'\n') {
                continue;
            }
            normalized.push(byte);
        }
        Ok(normalized)
    }
}

/// Prepends a line to text files.
#[derive(Debug)]
struct Banner {
    text: String,
}

impl Transform for Banner {
    fn name(&self) -> &str {
        "banner"
    }

    fn apply(&self, _path: &Path, contents: Vec<u8>) -> Result<Vec<u8>> {
        if !is_text(&contents) {
            return Ok(contents);
        }
        let mut out = Vec::with_capacity(self.text.len() + 1 + contents.len());
        out.extend_from_slice(self.text.as_bytes());
        out.push(b'\n');
        out.extend(contents);
        Ok(out)
    }
}

#[derive(Debug)]
struct CopyBackend;

impl Backend for CopyBackend {
    fn name(&self) -> &str {
        RUNNER
    }

    fn prepare(&self, ctx: &BuildContext, task: TaskDefinition) -> Result<Arc<dyn Job>> {
        let transforms = assemble(ctx, RUNNER, &task.bundle, PipelineBuilder::<CopyTransform>::new())?;
        debug!(
            task = %task.task,
            transforms = ?transforms.iter().map(|t| t.name()).collect::<Vec<_>>(),
            "prepared copy job"
        );
        Ok(Arc::new(CopyJob { task, transforms }))
    }
}

#[derive(Debug)]
struct CopyJob {
    task: TaskDefinition,
    transforms: Vec<CopyTransform>,
}

/// One file to copy: its source and its path below the glob base.
struct Entry {
    source: PathBuf,
    relative: PathBuf,
}

impl CopyJob {
    fn expand(&self, diagnostics: &mut Vec<Diagnostic>) -> Vec<Entry> {
        let mut entries = Vec::new();
        for pattern in &self.task.bundle.sources {
            let (base, _) = split_pattern(pattern);
            let paths = match glob::glob(pattern) {
                Ok(paths) => paths,
                Err(e) => {
                    diagnostics.push(Diagnostic::error(format!(
                        "invalid source pattern '{pattern}': {e}"
                    )));
                    continue;
                }
            };

            let before = entries.len();
            for path in paths {
                match path {
                    Ok(source) if source.is_file() => {
                        let relative = match source.strip_prefix(&base) {
                            Ok(relative) => relative.to_path_buf(),
                            Err(_) => source.file_name().map(PathBuf::from).unwrap_or_default(),
                        };
                        entries.push(Entry { source, relative });
                    }
                    Ok(_) => {}
                    Err(e) => diagnostics.push(
                        Diagnostic::warning(format!("skipped unreadable path: {}", e.error()))
                            .at(e.path(), None),
                    ),
                }
            }
            if entries.len() == before {
                diagnostics.push(Diagnostic::warning(format!(
                    "no files matched '{pattern}'"
                )));
            }
        }
        entries
    }

    fn transform(&self, path: &Path, mut contents: Vec<u8>) -> Result<Vec<u8>> {
        for transform in &self.transforms {
            contents = transform.apply(path, contents)?;
        }
        Ok(contents)
    }
}

#[async_trait]
impl Job for CopyJob {
    #[instrument(skip(self), fields(task = %self.task.task))]
    async fn run(&self) -> Result<BuildOutcome> {
        let mut diagnostics = Vec::new();
        let entries = self.expand(&mut diagnostics);
        let output_dir = self.task.output_dir();
        let mut outputs = Vec::with_capacity(entries.len());

        for entry in entries {
            let contents = match tokio::fs::read(&entry.source).await {
                Ok(contents) => contents,
                Err(e) => {
                    diagnostics.push(
                        Diagnostic::warning(format!("skipped unreadable file: {e}"))
                            .at(&entry.source, None),
                    );
                    continue;
                }
            };
            let contents = self.transform(&entry.source, contents)?;

            let target = output_dir.join(&entry.relative);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Error::io(parent, e))?;
            }
            tokio::fs::write(&target, contents)
                .await
                .map_err(|e| Error::io(&target, e))?;
            outputs.push(target);
        }

        debug!(copied = outputs.len(), "copy finished");
        Ok(BuildOutcome {
            succeeded: !diagnostics.iter().any(Diagnostic::is_error),
            outputs,
            diagnostics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{BuildOptions, Orchestrator, ProjectConfig};
    use std::fs;

    fn project(root: &Path, extra: &str) -> ProjectConfig {
        let text = format!(
            r#"
            destination = "{root}/dist"

            [images.images]
            source = "{root}/images/**"
            {extra}
            "#,
            root = root.display()
        );
        ProjectConfig::from_table(toml::from_str(&text).unwrap()).unwrap()
    }

    fn orchestrator(project: &ProjectConfig) -> Orchestrator {
        Orchestrator::new(
            vec![Arc::new(CopyPreset::new())],
            Some(project),
            BuildOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn normalize_eol_only_touches_text() {
        let out = NormalizeEol
            .apply(Path::new("a.txt"), b"one\r\ntwo\r\n".to_vec())
            .unwrap();
        assert_eq!(out, b"one\ntwo\n");

        let binary = vec![0x89, b'P', b'N', b'G', 0, b'\r', b'\n'];
        let out = NormalizeEol.apply(Path::new("a.png"), binary.clone()).unwrap();
        assert_eq!(out, binary);
    }

    #[test]
    fn registers_sole_images_bundle_as_category_task() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(&project(dir.path(), ""));
        assert_eq!(orchestrator.task_names(), vec!["images", "default"]);
    }

    #[tokio::test]
    async fn copies_files_below_glob_base_through_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("images");
        fs::create_dir_all(images.join("icons")).unwrap();
        fs::write(images.join("logo.png"), [0x89, b'P', b'N', b'G', 0]).unwrap();
        fs::write(images.join("icons/readme.txt"), "hello\r\nworld\r\n").unwrap();

        let orchestrator = orchestrator(&project(dir.path(), r#"banner = "/* kiln */""#));
        orchestrator.run("default").await.unwrap();

        let out = dir.path().join("dist/images");
        assert_eq!(
            fs::read(out.join("logo.png")).unwrap(),
            vec![0x89, b'P', b'N', b'G', 0]
        );
        assert_eq!(
            fs::read_to_string(out.join("icons/readme.txt")).unwrap(),
            "/* kiln */\nhello\nworld\n"
        );
    }

    #[tokio::test]
    async fn empty_source_is_a_warning_not_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(&project(dir.path(), ""));
        orchestrator.run("images").await.unwrap();
        assert!(!dir.path().join("dist/images").exists());
    }
}
