use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::StoreError;
use crate::model::{Extraction, ProjectRecord, TypologyRecord};
use crate::registry::ArtifactRecord;

/// A file that was fully written to its final path.
#[derive(Debug, Clone)]
pub struct WrittenFile {
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: u64,
    pub rows: Option<usize>,
}

impl WrittenFile {
    pub fn to_artifact(&self, url: Option<&str>, kind: &'static str) -> ArtifactRecord {
        ArtifactRecord {
            url: url.map(str::to_string),
            kind,
            path: self.path.display().to_string(),
            sha256: Some(self.sha256.clone()),
            bytes: self.bytes,
            rows: self.rows,
        }
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn ensure_parent(path: &Path) -> Result<(), StoreError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).map_err(io_err(parent))
        }
        _ => Ok(()),
    }
}

/// Write to a uniquely named sibling temp file, then rename over the target.
/// Readers never see a half-written file, and concurrent writers of one path
/// each publish a whole payload.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<WrittenFile, StoreError> {
    ensure_parent(path)?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{}.", name))
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(io_err(dir))?;
    tmp.write_all(contents).map_err(io_err(tmp.path()))?;
    // A dropped temp file deletes itself, so a failed rename leaves nothing behind.
    tmp.persist(path).map_err(|e| io_err(path)(e.error))?;
    Ok(WrittenFile {
        path: path.to_path_buf(),
        sha256: hex::encode(Sha256::digest(contents)),
        bytes: contents.len() as u64,
        rows: None,
    })
}

/// Row table as a JSON array, one object per record.
pub fn write_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<WrittenFile, StoreError> {
    let json = serde_json::to_vec_pretty(rows).map_err(|source| StoreError::Serde {
        path: path.display().to_string(),
        source,
    })?;
    let mut written = write_atomic(path, &json)?;
    written.rows = Some(rows.len());
    Ok(written)
}

#[cfg(test)]
pub fn read_rows<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
    let bytes = fs::read(path).map_err(io_err(path))?;
    serde_json::from_slice(&bytes).map_err(|source| StoreError::Serde {
        path: path.display().to_string(),
        source,
    })
}

pub fn write_project(path: &Path, project: &ProjectRecord) -> Result<WrittenFile, StoreError> {
    write_rows(path, std::slice::from_ref(project))
}

pub fn write_typologies(
    path: &Path,
    typologies: &[TypologyRecord],
) -> Result<WrittenFile, StoreError> {
    write_rows(path, typologies)
}

/// Output files of one extraction.
#[derive(Debug, Clone)]
pub struct RecordFiles {
    pub project: WrittenFile,
    pub typologies: WrittenFile,
}

/// Per-slug files of a batch. Overwritten on every run: last writer wins.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    out_dir: PathBuf,
    raw_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(out_dir: impl Into<PathBuf>, raw_dir: Option<PathBuf>) -> Self {
        let out_dir = out_dir.into();
        let raw_dir = raw_dir.unwrap_or_else(|| out_dir.join("raw"));
        ArtifactStore { out_dir, raw_dir }
    }

    /// Create both directories up front so an unwritable location fails before
    /// any fetch.
    pub fn prepare(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.out_dir).map_err(io_err(&self.out_dir))?;
        fs::create_dir_all(&self.raw_dir).map_err(io_err(&self.raw_dir))
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn raw_dir(&self) -> &Path {
        &self.raw_dir
    }

    pub fn project_path(&self, slug: &str) -> PathBuf {
        self.out_dir.join(format!("{}__proyecto.json", slug))
    }

    pub fn typologies_path(&self, slug: &str) -> PathBuf {
        self.out_dir.join(format!("{}__tipologias.json", slug))
    }

    pub fn raw_path(&self, slug: &str) -> PathBuf {
        self.raw_dir.join(format!("{}.html", slug))
    }

    pub fn cards_path(&self, slug: &str) -> PathBuf {
        self.raw_dir.join(format!("{}__cards.txt", slug))
    }

    pub fn summary_path(&self, run_id: &str) -> PathBuf {
        self.out_dir.join(format!("run_{}.txt", run_id))
    }

    pub fn write_raw(&self, slug: &str, html: &[u8]) -> Result<WrittenFile, StoreError> {
        write_atomic(&self.raw_path(slug), html)
    }

    pub fn write_records(&self, extraction: &Extraction) -> Result<RecordFiles, StoreError> {
        let slug = &extraction.project.slug;
        Ok(RecordFiles {
            project: write_project(&self.project_path(slug), &extraction.project)?,
            typologies: write_typologies(&self.typologies_path(slug), &extraction.typologies)?,
        })
    }

    pub fn write_cards_dump(&self, slug: &str, cards: &[String]) -> Result<WrittenFile, StoreError> {
        let mut text = String::new();
        for (i, card) in cards.iter().enumerate() {
            text.push_str(&format!("--- card {} ---\n{}\n", i + 1, card));
        }
        let mut written = write_atomic(&self.cards_path(slug), text.as_bytes())?;
        written.rows = Some(cards.len());
        Ok(written)
    }

    pub fn write_run_summary(&self, run_id: &str, text: &str) -> Result<WrittenFile, StoreError> {
        write_atomic(&self.summary_path(run_id), text.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;

    const URL: &str = "https://nexoinmobiliario.pe/departamentos/jesus-maria/torre-napoles-3060";

    fn torre() -> Extraction {
        let html = fs::read_to_string("tests/fixtures/torre_napoles.html").unwrap();
        parser::extract(&html, URL)
    }

    #[test]
    fn records_read_back_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), None);
        let extraction = torre();

        let files = store.write_records(&extraction).unwrap();
        assert_eq!(files.project.rows, Some(1));
        assert_eq!(files.typologies.rows, Some(3));

        let projects: Vec<ProjectRecord> = read_rows(&files.project.path).unwrap();
        let typologies: Vec<TypologyRecord> = read_rows(&files.typologies.path).unwrap();
        assert_eq!(projects, vec![extraction.project.clone()]);
        assert_eq!(typologies, extraction.typologies);
    }

    #[test]
    fn raw_dir_defaults_under_out_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), None);
        store.prepare().unwrap();
        let written = store.write_raw("abc", b"<html></html>").unwrap();
        assert_eq!(written.path, dir.path().join("raw").join("abc.html"));
        assert_eq!(written.bytes, 13);
        assert_eq!(fs::read(&written.path).unwrap(), b"<html></html>");
    }

    #[test]
    fn atomic_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.json");
        write_atomic(&path, b"first").unwrap();
        let written = write_atomic(&path, b"second").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");
        assert_eq!(
            written.sha256,
            "16367aacb67a4a017c8da8ab95682ccb390863780f7114dda0a0e0c55644c7c4"
        );
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn concurrent_writers_publish_one_whole_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slug__tipologias.json");
        let a = vec![b'a'; 4 << 20];
        let b = vec![b'b'; 2 << 20];

        for _ in 0..5 {
            std::thread::scope(|s| {
                let ta = s.spawn(|| write_atomic(&path, &a));
                let tb = s.spawn(|| write_atomic(&path, &b));
                assert!(ta.join().unwrap().is_ok());
                assert!(tb.join().unwrap().is_ok());
            });
            let bytes = fs::read(&path).unwrap();
            assert!(bytes == a || bytes == b);
        }
        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn cards_dump_and_summary_names() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("html");
        let store = ArtifactStore::new(dir.path(), Some(raw.clone()));

        let dump = store
            .write_cards_dump("slug", &["Modelo A".into(), "Modelo B".into()])
            .unwrap();
        assert_eq!(dump.path, raw.join("slug__cards.txt"));
        assert_eq!(dump.rows, Some(2));
        assert!(fs::read_to_string(&dump.path).unwrap().contains("--- card 2 ---\nModelo B"));

        let summary = store.write_run_summary("run-1", "done\n").unwrap();
        assert_eq!(summary.path, dir.path().join("run_run-1.txt"));
        let artifact = summary.to_artifact(None, "run_summary");
        assert_eq!(artifact.bytes, 5);
        assert_eq!(artifact.sha256.as_deref(), Some(summary.sha256.as_str()));
    }
}
