//! Pattern fingerprints, path templating and match scoring.

use chrono::Utc;
use wpheal::learning::{
    error_pattern_for, fingerprint, match_score, normalize_error_message, render_command,
    templatize_command, MATCH_FLOOR,
};
use wpheal::model::{CausalDiagnosis, CulpritKind, DiagnosisType, HealingPattern};

fn plugin_fault(plugin: &str, message: &str) -> CausalDiagnosis {
    CausalDiagnosis {
        diagnosis_type: DiagnosisType::PluginFault,
        confidence: 0.95,
        culprit: Some(plugin.to_string()),
        culprit_kind: Some(CulpritKind::Plugin),
        error_type: Some("plugin_fault".to_string()),
        error_message: Some(message.to_string()),
        suggested_action: format!("Deactivate plugin {}", plugin),
        suggested_commands: vec![],
        evidence: vec![],
    }
}

fn learned_from(diagnosis: &CausalDiagnosis) -> HealingPattern {
    HealingPattern {
        id: fingerprint(diagnosis),
        diagnosis_type: diagnosis.diagnosis_type,
        error_type: diagnosis.error_type.clone(),
        culprit: diagnosis.culprit.clone().unwrap_or_else(|| "*".to_string()),
        error_pattern: diagnosis.error_message.as_deref().map(error_pattern_for),
        commands: vec!["wp plugin deactivate shop --path={path}".to_string()],
        description: "deactivate".to_string(),
        success_count: 3,
        failure_count: 0,
        confidence: 1.0,
        auto_approve: false,
        verified: false,
        created_at: Utc::now(),
        last_used_at: None,
        last_success_at: None,
        last_failure_at: None,
    }
}

const FATAL_A: &str =
    "Uncaught Error: Call to undefined function shop_init() in /var/www/a/wp-content/plugins/shop/shop.php:12";
const FATAL_B: &str =
    "Uncaught Error: Call to undefined function shop_init() in /srv/b/wp-content/plugins/shop/shop.php:480";

#[test]
fn test_normalization_strips_paths_and_numbers() {
    assert_eq!(normalize_error_message(FATAL_A), normalize_error_message(FATAL_B));
    assert!(!normalize_error_message(FATAL_A).contains("/var/www"));
}

#[test]
fn test_fingerprint_is_site_independent() {
    let a = fingerprint(&plugin_fault("shop", FATAL_A));
    let b = fingerprint(&plugin_fault("shop", FATAL_B));
    assert_eq!(a, b);
    assert!(a.starts_with("pat_"));
    assert_ne!(a, fingerprint(&plugin_fault("cart", FATAL_A)));
}

#[test]
fn test_templating_replays_on_other_path() {
    let cmd = "wp plugin deactivate shop --path=/var/www/a";
    let template = templatize_command(cmd, "/var/www/a");
    assert_eq!(template, "wp plugin deactivate shop --path={path}");
    assert_eq!(
        render_command(&template, "/srv/b"),
        "wp plugin deactivate shop --path=/srv/b"
    );
    assert_eq!(
        render_command(&template, "/srv/my site"),
        "wp plugin deactivate shop --path='/srv/my site'"
    );
}

#[test]
fn test_match_scores() {
    let learned = learned_from(&plugin_fault("shop", FATAL_A));

    // Same failure on another site: regex boost.
    assert!(match_score(&learned, &plugin_fault("shop", FATAL_B)) > 1.0);

    // Different culprit drops to the floor and is never suggested.
    assert_eq!(match_score(&learned, &plugin_fault("cart", FATAL_B)), MATCH_FLOOR);

    // Different message: regex miss penalty.
    let other = plugin_fault("shop", "Allowed memory size exhausted");
    let score = match_score(&learned, &other);
    assert!(score > MATCH_FLOOR && score < 1.0);

    let mut theme = plugin_fault("shop", FATAL_A);
    theme.diagnosis_type = DiagnosisType::ThemeFault;
    assert_eq!(match_score(&learned, &theme), 0.0);
}
