//! Read-only tools over a project's documents directory.
//!
//! Paths given by the model are Unix-style and relative to the documents
//! root (`/` is the root itself). Nothing outside the root is reachable.

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, bail};
use async_trait::async_trait;
use llm_core::ToolDefinition;
use regex::{Regex, RegexBuilder};
use serde_json::{Value, json};

use super::Tool;

const MAX_CONTENT_CHARS: usize = 20_000;
const DEFAULT_TREE_DEPTH: u64 = 2;
const MAX_TREE_DEPTH: u64 = 5;
const DEFAULT_SEARCH_LIMIT: usize = 5;
const MAX_SEARCH_LIMIT: usize = 20;
const PREVIEW_CHARS: usize = 200;

/// Extensions never treated as documents.
const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "ico", "webp", "pdf", "zip", "tar", "gz", "7z", "mp3",
    "mp4", "wav", "mov", "exe", "dll", "so", "dylib", "wasm", "db", "sqlite",
];

/// A path inside the documents root.
struct DocPath {
    fs: PathBuf,
    display: String,
}

fn resolve(root: &Path, requested: &str) -> anyhow::Result<DocPath> {
    let trimmed = requested.trim().trim_start_matches('/');
    let mut fs = root.to_path_buf();
    let mut parts = Vec::new();

    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => {
                fs.push(part);
                parts.push(part.to_string_lossy().to_string());
            }
            Component::CurDir => {}
            _ => bail!("path is outside the documents root: {requested}"),
        }
    }

    // Symlinks must not lead out of the root either.
    if let (Ok(real), Ok(real_root)) = (fs.canonicalize(), root.canonicalize()) {
        if !real.starts_with(&real_root) {
            bail!("path is outside the documents root: {requested}");
        }
    }

    Ok(DocPath {
        fs,
        display: format!("/{}", parts.join("/")),
    })
}

fn display_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    format!("/{}", parts.join("/"))
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

fn is_document(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_none_or(|ext| !BINARY_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

fn truncate_chars(text: &str, max: usize) -> (String, bool) {
    match text.char_indices().nth(max) {
        Some((cut, _)) => (text[..cut].to_string(), true),
        None => (text.to_string(), false),
    }
}

/// Folders and documents directly inside `dir`, sorted by name.
fn read_folder(dir: &Path) -> anyhow::Result<(Vec<PathBuf>, Vec<PathBuf>)> {
    let mut folders = Vec::new();
    let mut documents = Vec::new();

    for entry in std::fs::read_dir(dir).with_context(|| format!("cannot read {}", dir.display()))? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if is_hidden(&name) {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            folders.push(path);
        } else if is_document(&path) {
            documents.push(path);
        }
    }

    folders.sort();
    documents.sort();
    Ok((folders, documents))
}

fn document_entry(path: &Path) -> Value {
    let bytes = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    json!({
        "name": path.file_name().map(|n| n.to_string_lossy().to_string()),
        "bytes": bytes,
    })
}

fn folder_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn build_tree(dir: &Path, remaining: u64) -> anyhow::Result<Value> {
    if remaining == 0 {
        return Ok(json!({"folders": [], "documents": []}));
    }

    let (folders, documents) = read_folder(dir)?;
    let mut folder_list = Vec::with_capacity(folders.len());
    for folder in &folders {
        let subtree = build_tree(folder, remaining - 1)?;
        folder_list.push(json!({
            "name": folder_name(folder),
            "folders": subtree["folders"],
            "documents": subtree["documents"],
        }));
    }

    Ok(json!({
        "folders": folder_list,
        "documents": documents.iter().map(|d| document_entry(d)).collect::<Vec<_>>(),
    }))
}

async fn blocking<T: Send + 'static>(
    f: impl FnOnce() -> anyhow::Result<T> + Send + 'static,
) -> anyhow::Result<T> {
    tokio::task::spawn_blocking(f)
        .await
        .context("document tool task failed")?
}

/// `doc_tree`: folder hierarchy down to a depth.
#[derive(Debug, Clone)]
pub struct DocTreeTool {
    root: PathBuf,
}

impl DocTreeTool {
    #[must_use]
    pub const fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl Tool for DocTreeTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::custom(
            "doc_tree",
            "Show the folder and document hierarchy under a folder.",
            json!({
                "type": "object",
                "properties": {
                    "folder": {
                        "type": "string",
                        "description": "Unix-style folder path, '/' for the project root"
                    },
                    "depth": {
                        "type": "integer",
                        "description": "Levels to descend (default 2, max 5)"
                    }
                },
                "required": ["folder"]
            }),
        )
    }

    async fn execute(&self, input: Value) -> anyhow::Result<Value> {
        let folder = input["folder"].as_str().unwrap_or("/");
        let depth = input["depth"]
            .as_u64()
            .unwrap_or(DEFAULT_TREE_DEPTH)
            .clamp(1, MAX_TREE_DEPTH);
        let target = resolve(&self.root, folder)?;

        tracing::info!(path = %target.display, depth, "document tree");

        if !target.fs.is_dir() {
            bail!("folder not found: {}", target.display);
        }
        let display = target.display.clone();
        let mut tree = blocking(move || build_tree(&target.fs, depth)).await?;
        tree["type"] = json!("tree");
        tree["path"] = json!(display);
        tree["depth"] = json!(depth);
        Ok(tree)
    }
}

/// `doc_view`: read one document, or list a folder.
#[derive(Debug, Clone)]
pub struct DocViewTool {
    root: PathBuf,
}

impl DocViewTool {
    #[must_use]
    pub const fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl Tool for DocViewTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::custom(
            "doc_view",
            "Read a document's content, or list the contents of a folder.",
            json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Unix-style path to a document or folder"
                    }
                },
                "required": ["path"]
            }),
        )
    }

    async fn execute(&self, input: Value) -> anyhow::Result<Value> {
        let path = input["path"]
            .as_str()
            .filter(|p| !p.trim().is_empty())
            .context("missing required parameter: path")?;
        let target = resolve(&self.root, path)?;

        tracing::info!(path = %target.display, "viewing document");

        if target.fs.is_dir() {
            let display = target.display.clone();
            let (folders, documents) = blocking(move || read_folder(&target.fs)).await?;
            return Ok(json!({
                "type": "folder",
                "path": display,
                "folders": folders.iter().map(|f| folder_name(f)).collect::<Vec<_>>(),
                "documents": documents.iter().map(|d| document_entry(d)).collect::<Vec<_>>(),
            }));
        }

        if !target.fs.is_file() || !is_document(&target.fs) {
            bail!("path not found: {}", target.display);
        }

        let content = tokio::fs::read_to_string(&target.fs)
            .await
            .with_context(|| format!("cannot read {}", target.display))?;
        let word_count = content.split_whitespace().count();
        let (mut content, was_truncated) = truncate_chars(&content, MAX_CONTENT_CHARS);
        if was_truncated {
            content.push_str("\n\n[Content truncated - too large to display fully]");
        }

        Ok(json!({
            "type": "document",
            "name": folder_name(&target.fs),
            "path": target.display,
            "content": content,
            "word_count": word_count,
            "was_truncated": was_truncated,
        }))
    }
}

/// `doc_search`: case-insensitive search across document contents.
#[derive(Debug, Clone)]
pub struct DocSearchTool {
    root: PathBuf,
}

impl DocSearchTool {
    #[must_use]
    pub const fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

/// Case-insensitive pattern; invalid regex syntax is matched literally.
fn search_pattern(query: &str) -> anyhow::Result<Regex> {
    RegexBuilder::new(query)
        .case_insensitive(true)
        .build()
        .or_else(|_| {
            RegexBuilder::new(&regex::escape(query))
                .case_insensitive(true)
                .build()
        })
        .context("invalid search query")
}

fn preview(content: &str, pattern: &Regex) -> String {
    let line = content
        .lines()
        .find(|l| pattern.is_match(l))
        .unwrap_or_default()
        .trim();
    let (mut text, truncated) = truncate_chars(line, PREVIEW_CHARS);
    if truncated {
        text.push_str("...");
    }
    text
}

fn search(root: &Path, dir: &Path, pattern: &Regex) -> Vec<(usize, String, String)> {
    let walker = ignore::WalkBuilder::new(dir)
        .hidden(true)
        .git_ignore(true)
        .standard_filters(true)
        .build();

    let mut hits = Vec::new();
    for entry in walker.flatten() {
        let path = entry.path();
        if !path.is_file() || !is_document(path) {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(path) else {
            continue;
        };
        let score = pattern.find_iter(&content).count();
        if score > 0 {
            hits.push((score, display_path(root, path), preview(&content, pattern)));
        }
    }

    hits.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    hits
}

#[async_trait]
impl Tool for DocSearchTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::custom(
            "doc_search",
            "Search document contents. Case-insensitive; accepts plain text or a regular expression.",
            json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Text or pattern to search for"
                    },
                    "folder": {
                        "type": "string",
                        "description": "Limit the search to this folder"
                    },
                    "limit": {
                        "type": "integer",
                        "description": "Maximum results (default 5, max 20)"
                    }
                },
                "required": ["query"]
            }),
        )
    }

    async fn execute(&self, input: Value) -> anyhow::Result<Value> {
        let query = input["query"]
            .as_str()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .context("missing required parameter: query")?;
        let limit = input["limit"]
            .as_u64()
            .map_or(DEFAULT_SEARCH_LIMIT, |l| {
                usize::try_from(l).unwrap_or(MAX_SEARCH_LIMIT)
            })
            .clamp(1, MAX_SEARCH_LIMIT);
        let folder = resolve(&self.root, input["folder"].as_str().unwrap_or("/"))?;
        if !folder.fs.is_dir() {
            bail!("folder not found: {}", folder.display);
        }
        let pattern = search_pattern(query)?;

        tracing::info!(query = %query, folder = %folder.display, "document search");

        let root = self.root.clone();
        let hits = blocking(move || Ok(search(&root, &folder.fs, &pattern))).await?;
        let count = hits.len();
        let results: Vec<Value> = hits
            .into_iter()
            .take(limit)
            .map(|(score, path, preview)| {
                json!({
                    "name": path.rsplit('/').next(),
                    "path": path,
                    "score": score,
                    "preview": preview,
                })
            })
            .collect();

        Ok(json!({
            "results": results,
            "count": count,
            "has_more": count > limit,
            "limit": limit,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("drafts/old")).unwrap();
        std::fs::write(root.join("outline.md"), "Act one. The Lighthouse keeper.").unwrap();
        std::fs::write(
            root.join("drafts/chapter1.md"),
            "The lighthouse was dark.\nNobody came.\nLIGHTHOUSE again.",
        )
        .unwrap();
        std::fs::write(root.join("drafts/old/scrap.md"), "deep and forgotten").unwrap();
        std::fs::write(root.join(".secret.md"), "lighthouse").unwrap();
        dir
    }

    #[tokio::test]
    async fn tree_respects_depth() {
        let dir = project();
        let tool = DocTreeTool::new(dir.path().to_path_buf());

        let tree = tool.execute(json!({"folder": "/", "depth": 1})).await.unwrap();
        assert_eq!(tree["type"], "tree");
        assert_eq!(tree["folders"][0]["name"], "drafts");
        assert_eq!(tree["folders"][0]["documents"], json!([]));
        assert_eq!(tree["documents"].as_array().unwrap().len(), 1);

        let tree = tool.execute(json!({"folder": "drafts"})).await.unwrap();
        assert_eq!(tree["path"], "/drafts");
        assert_eq!(tree["documents"][0]["name"], "chapter1.md");
        assert_eq!(tree["folders"][0]["name"], "old");
    }

    #[tokio::test]
    async fn view_reads_documents_and_folders() {
        let dir = project();
        let tool = DocViewTool::new(dir.path().to_path_buf());

        let doc = tool
            .execute(json!({"path": "/drafts/chapter1.md"}))
            .await
            .unwrap();
        assert_eq!(doc["type"], "document");
        assert_eq!(doc["word_count"], 8);
        assert_eq!(doc["was_truncated"], false);

        let folder = tool.execute(json!({"path": "/"})).await.unwrap();
        assert_eq!(folder["type"], "folder");
        assert_eq!(folder["folders"], json!(["drafts"]));
        assert_eq!(folder["documents"][0]["name"], "outline.md");
    }

    #[tokio::test]
    async fn view_refuses_escapes_and_missing_paths() {
        let dir = project();
        let tool = DocViewTool::new(dir.path().join("drafts"));

        let err = tool.execute(json!({"path": "../outline.md"})).await.unwrap_err();
        assert!(err.to_string().contains("outside"));
        assert!(tool.execute(json!({"path": "/nope.md"})).await.is_err());
        assert!(tool.execute(json!({})).await.is_err());
    }

    #[tokio::test]
    async fn search_is_case_insensitive_and_ranked() {
        let dir = project();
        let tool = DocSearchTool::new(dir.path().to_path_buf());

        let found = tool.execute(json!({"query": "lighthouse"})).await.unwrap();
        assert_eq!(found["count"], 2);
        assert_eq!(found["results"][0]["path"], "/drafts/chapter1.md");
        assert_eq!(found["results"][0]["score"], 2);
        assert_eq!(found["results"][0]["preview"], "The lighthouse was dark.");

        let scoped = tool
            .execute(json!({"query": "lighthouse", "folder": "/drafts/old"}))
            .await
            .unwrap();
        assert_eq!(scoped["count"], 0);
    }

    #[tokio::test]
    async fn search_falls_back_to_literal_text() {
        let dir = project();
        std::fs::write(dir.path().join("notes.md"), "costs (approx").unwrap();
        let tool = DocSearchTool::new(dir.path().to_path_buf());

        let found = tool.execute(json!({"query": "(approx"})).await.unwrap();
        assert_eq!(found["count"], 1);
        assert_eq!(found["results"][0]["name"], "notes.md");
    }
}
