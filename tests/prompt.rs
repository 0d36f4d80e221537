//! Integration tests for environment assembly and skill selection.

use std::collections::HashSet;
use std::path::PathBuf;

use marshal::credentials::Credentials;
use marshal::prompt::{assemble_environment, fingerprint_skills, load_skills, select_skills, SelectionContext};
use marshal::types::SourceType;
use tempfile::TempDir;

#[test]
fn restricted_environment_excludes_parent_vars_not_declared() {
    std::env::set_var("MARSHAL_TEST_SECRET", "should-not-leak");
    let creds = Credentials::default();
    let env = assemble_environment(true, &[], &creds, false, &PathBuf::from("/tmp/deferred"));
    assert!(!env.contains_key("MARSHAL_TEST_SECRET"));
    assert!(env.contains_key("DEFERRED_DIR"));
    std::env::remove_var("MARSHAL_TEST_SECRET");
}

#[test]
fn permissive_environment_includes_parent_vars() {
    std::env::set_var("MARSHAL_TEST_VISIBLE", "yes");
    let creds = Credentials::default();
    let env = assemble_environment(false, &[], &creds, false, &PathBuf::from("/tmp/deferred"));
    assert_eq!(env.get("MARSHAL_TEST_VISIBLE").map(String::as_str), Some("yes"));
    std::env::remove_var("MARSHAL_TEST_VISIBLE");
}

#[test]
fn strip_sensitive_removes_matching_vars_even_in_permissive_mode() {
    std::env::set_var("MARSHAL_TEST_API_KEY", "sekrit");
    let creds = Credentials::default();
    let env = assemble_environment(false, &[], &creds, true, &PathBuf::from("/tmp/deferred"));
    assert!(!env.contains_key("MARSHAL_TEST_API_KEY"));
    std::env::remove_var("MARSHAL_TEST_API_KEY");
}

#[test]
fn declared_vars_are_resolved_from_credentials_not_the_parent_env() {
    let mut path = std::env::temp_dir();
    path.push(format!("marshal-test-creds-{}", std::process::id()));
    std::fs::write(&path, "GITHUB_TOKEN=from-credentials-file\n").unwrap();
    let creds = marshal::credentials::load_credentials(&path).unwrap();
    std::fs::remove_file(&path).ok();

    let env = assemble_environment(true, &["GITHUB_TOKEN".to_owned()], &creds, false, &PathBuf::from("/tmp/deferred"));
    assert_eq!(env.get("GITHUB_TOKEN").map(String::as_str), Some("from-credentials-file"));
}

#[test]
fn deferred_dir_is_always_injected() {
    let creds = Credentials::default();
    let env = assemble_environment(true, &[], &creds, false, &PathBuf::from("/var/data/deferred/7"));
    assert_eq!(env.get("DEFERRED_DIR").map(String::as_str), Some("/var/data/deferred/7"));
}

fn write_skill(root: &std::path::Path, dir_name: &str, manifest_toml: &str, doc: &str) {
    let dir = root.join(dir_name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("manifest.toml"), manifest_toml).unwrap();
    std::fs::write(dir.join("doc.md"), doc).unwrap();
}

#[test]
fn load_skills_skips_directories_with_no_manifest() {
    let dir = TempDir::new().unwrap();
    write_skill(dir.path(), "calendar", "keywords = [\"schedule\"]\n", "# Calendar\n");
    std::fs::create_dir_all(dir.path().join("not-a-skill")).unwrap();

    let skills = load_skills(dir.path()).unwrap();
    assert_eq!(skills.len(), 1);
    assert_eq!(skills[0].manifest.dir_name, "calendar");
}

#[test]
fn select_skills_matches_by_keyword_and_pulls_in_companions() {
    let dir = TempDir::new().unwrap();
    write_skill(
        dir.path(),
        "calendar",
        "keywords = [\"schedule\", \"meeting\"]\ncompanion_skills = [\"timezone\"]\n",
        "# Calendar\n",
    );
    write_skill(dir.path(), "timezone", "", "# Timezone\n");
    write_skill(dir.path(), "unrelated", "keywords = [\"invoice\"]\n", "# Invoicing\n");

    let skills = load_skills(dir.path()).unwrap();
    let ctx = SelectionContext {
        prompt_text: "please schedule a meeting for tomorrow",
        source_type: SourceType::Talk,
        user_resource_types: &HashSet::new(),
        attachment_extensions: &HashSet::new(),
        is_admin: false,
    };
    let selected = select_skills(&skills, &ctx);
    let names: Vec<&str> = selected.iter().map(|s| s.manifest.dir_name.as_str()).collect();
    assert!(names.contains(&"calendar"));
    assert!(names.contains(&"timezone"), "a selected skill's companion must be pulled in");
    assert!(!names.contains(&"unrelated"));
}

#[test]
fn select_skills_drops_admin_only_skills_for_non_admins() {
    let dir = TempDir::new().unwrap();
    write_skill(dir.path(), "ops", "always_include = true\nadmin_only = true\n", "# Ops\n");

    let skills = load_skills(dir.path()).unwrap();
    let ctx = SelectionContext {
        prompt_text: "anything",
        source_type: SourceType::Talk,
        user_resource_types: &HashSet::new(),
        attachment_extensions: &HashSet::new(),
        is_admin: false,
    };
    assert!(select_skills(&skills, &ctx).is_empty());

    let admin_ctx = SelectionContext { is_admin: true, ..ctx };
    assert_eq!(select_skills(&skills, &admin_ctx).len(), 1);
}

#[test]
fn select_skills_skips_skill_with_unsatisfied_dependency() {
    let dir = TempDir::new().unwrap();
    write_skill(dir.path(), "advanced", "always_include = true\ndependencies = [\"missing\"]\n", "# Advanced\n");

    let skills = load_skills(dir.path()).unwrap();
    let ctx = SelectionContext {
        prompt_text: "anything",
        source_type: SourceType::Talk,
        user_resource_types: &HashSet::new(),
        attachment_extensions: &HashSet::new(),
        is_admin: false,
    };
    assert!(select_skills(&skills, &ctx).is_empty());
}

#[test]
fn fingerprint_changes_when_a_selected_skills_doc_changes() {
    let dir = TempDir::new().unwrap();
    write_skill(dir.path(), "calendar", "always_include = true\n", "# Calendar v1\n");
    let skills_v1 = load_skills(dir.path()).unwrap();
    let selected_v1: Vec<&marshal::prompt::Skill> = skills_v1.iter().collect();
    let fp1 = fingerprint_skills(&selected_v1);

    write_skill(dir.path(), "calendar", "always_include = true\n", "# Calendar v2\n");
    let skills_v2 = load_skills(dir.path()).unwrap();
    let selected_v2: Vec<&marshal::prompt::Skill> = skills_v2.iter().collect();
    let fp2 = fingerprint_skills(&selected_v2);

    assert_ne!(fp1, fp2);
}

#[test]
fn fingerprint_is_stable_for_identical_selection() {
    let dir = TempDir::new().unwrap();
    write_skill(dir.path(), "calendar", "always_include = true\n", "# Calendar\n");
    let skills = load_skills(dir.path()).unwrap();
    let selected: Vec<&marshal::prompt::Skill> = skills.iter().collect();
    assert_eq!(fingerprint_skills(&selected), fingerprint_skills(&selected));
}
