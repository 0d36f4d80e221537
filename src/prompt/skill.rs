//! Skill manifests and selection (spec 4.3).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::types::SourceType;

/// One selectable bundle of prompt documentation (spec GLOSSARY: Skill).
#[derive(Debug, Clone, Deserialize)]
pub struct SkillManifest {
    /// Directory name, filled in after loading (not part of the TOML).
    #[serde(skip)]
    pub dir_name: String,
    /// Case-insensitive substrings of the task prompt that select this skill.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Resource types that select this skill when the user has a matching resource.
    #[serde(default)]
    pub resource_types: Vec<String>,
    /// Source types that unconditionally select this skill.
    #[serde(default)]
    pub source_types: Vec<SourceType>,
    /// Attachment file extensions that select this skill.
    #[serde(default)]
    pub file_types: Vec<String>,
    /// Always selected regardless of task content.
    #[serde(default)]
    pub always_include: bool,
    /// Only selected for admin users.
    #[serde(default)]
    pub admin_only: bool,
    /// Other skill directory names that must also be present for this
    /// skill to be eligible.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Skill directory names pulled in transitively once this skill is selected.
    #[serde(default)]
    pub companion_skills: Vec<String>,
    /// Environment variable names this skill needs resolved into the
    /// child's environment.
    #[serde(default)]
    pub env: Vec<String>,
}

/// A loaded skill: manifest plus its documentation body.
#[derive(Debug, Clone)]
pub struct Skill {
    /// Parsed manifest.
    pub manifest: SkillManifest,
    /// Contents of the skill's doc file, inserted into the prompt when selected.
    pub doc: String,
}

/// Errors loading skills from disk.
#[derive(Debug, thiserror::Error)]
pub enum SkillLoadError {
    /// The skills directory could not be read.
    #[error("failed to read skills dir {0}: {1}")]
    ReadDir(PathBuf, std::io::Error),
    /// A skill's manifest.toml failed to parse.
    #[error("failed to parse manifest for skill {0}: {1}")]
    ParseManifest(String, toml::de::Error),
}

/// Load every skill subdirectory containing a `manifest.toml`.
///
/// # Errors
///
/// Returns a [`SkillLoadError`] if the skills directory cannot be listed.
/// Individual skills with unreadable manifests are skipped with a
/// logged warning rather than aborting the whole load.
pub fn load_skills(skills_dir: &Path) -> Result<Vec<Skill>, SkillLoadError> {
    if !skills_dir.exists() {
        return Ok(Vec::new());
    }
    let entries = std::fs::read_dir(skills_dir)
        .map_err(|e| SkillLoadError::ReadDir(skills_dir.to_path_buf(), e))?;

    let mut skills = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let dir_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let manifest_path = path.join("manifest.toml");
        if !manifest_path.exists() {
            continue;
        }
        let raw = match std::fs::read_to_string(&manifest_path) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(skill = %dir_name, %err, "failed to read skill manifest");
                continue;
            }
        };
        let mut manifest: SkillManifest = match toml::from_str(&raw) {
            Ok(manifest) => manifest,
            Err(err) => {
                tracing::warn!(skill = %dir_name, %err, "failed to parse skill manifest");
                continue;
            }
        };
        manifest.dir_name = dir_name.clone();

        let doc_path = path.join("doc.md");
        let doc = std::fs::read_to_string(&doc_path).unwrap_or_default();

        skills.push(Skill { manifest, doc });
    }
    Ok(skills)
}

/// Inputs available for skill selection (spec 4.3).
pub struct SelectionContext<'a> {
    /// The (possibly transcription-expanded) task prompt text.
    pub prompt_text: &'a str,
    /// Source type of the task.
    pub source_type: SourceType,
    /// Resource types the user has at least one resource of.
    pub user_resource_types: &'a HashSet<String>,
    /// Attachment file extensions (lowercase, no leading dot).
    pub attachment_extensions: &'a HashSet<String>,
    /// Whether the requesting user is an admin.
    pub is_admin: bool,
}

/// Select and order the skills applicable to one task (spec 4.3 Skill selection).
///
/// Companion skills are pulled in after the initial pass (non-transitively,
/// per spec); admin-only skills are dropped for non-admin users; skills with
/// unsatisfied dependencies are skipped.
pub fn select_skills<'a>(skills: &'a [Skill], ctx: &SelectionContext<'_>) -> Vec<&'a Skill> {
    let by_name: std::collections::HashMap<&str, &Skill> =
        skills.iter().map(|s| (s.manifest.dir_name.as_str(), s)).collect();

    let prompt_lower = ctx.prompt_text.to_lowercase();
    let matches_directly = |skill: &Skill| -> bool {
        let m = &skill.manifest;
        m.always_include
            || m.source_types.contains(&ctx.source_type)
            || m.resource_types.iter().any(|rt| ctx.user_resource_types.contains(rt))
            || m.file_types.iter().any(|ft| ctx.attachment_extensions.contains(ft.trim_start_matches('.')))
            || m.keywords.iter().any(|kw| prompt_lower.contains(&kw.to_lowercase()))
    };

    let mut selected: Vec<&str> = Vec::new();
    let mut seen = HashSet::new();

    for skill in skills {
        if matches_directly(skill) && seen.insert(skill.manifest.dir_name.clone()) {
            selected.push(&skill.manifest.dir_name);
        }
    }

    let initial = selected.clone();
    for name in initial {
        if let Some(skill) = by_name.get(name) {
            for companion in &skill.manifest.companion_skills {
                if seen.insert(companion.clone()) {
                    selected.push(companion.as_str());
                }
            }
        }
    }

    selected
        .into_iter()
        .filter_map(|name| by_name.get(name).copied())
        .filter(|skill| !(skill.manifest.admin_only && !ctx.is_admin))
        .filter(|skill| {
            let ok = skill
                .manifest
                .dependencies
                .iter()
                .all(|dep| by_name.contains_key(dep.as_str()));
            if !ok {
                tracing::warn!(
                    skill = %skill.manifest.dir_name,
                    "skipping skill with unsatisfied dependencies"
                );
            }
            ok
        })
        .collect()
}

/// SHA-256 fingerprint over the selected skills' manifests and docs
/// (spec 4.3 "what's new" changelog mechanism).
pub fn fingerprint_skills(selected: &[&Skill]) -> String {
    let mut hasher = Sha256::new();
    for skill in selected {
        hasher.update(skill.manifest.dir_name.as_bytes());
        hasher.update(b"\0");
        hasher.update(skill.doc.as_bytes());
        hasher.update(b"\0");
    }
    hex::encode(hasher.finalize())
}
