//! Predefined mode trees.
//!
//! Factory functions building [`ModeRegistry`] instances for common network
//! device families, pre-configured with their prompts, enter/exit commands
//! and pagination settings.

use crate::error::CliError;
use crate::mode::{ModeDefinition, ModeRegistry};

/// Built-in template names supported by this crate.
pub const BUILTIN_TEMPLATES: &[&str] = &["cisco", "huawei", "juniper"];

/// Returns names of all built-in templates.
pub fn available_templates() -> &'static [&'static str] {
    BUILTIN_TEMPLATES
}

/// Mode definitions of a built-in template by name (case-insensitive).
pub fn definitions(name: &str) -> Result<Vec<ModeDefinition>, CliError> {
    match name.to_ascii_lowercase().as_str() {
        "cisco" => Ok(cisco_definitions()),
        "huawei" => Ok(huawei_definitions()),
        "juniper" => Ok(juniper_definitions()),
        _ => Err(CliError::TemplateNotFound(name.to_string())),
    }
}

/// Creates a built-in template by name (case-insensitive).
pub fn by_name(name: &str) -> Result<ModeRegistry, CliError> {
    ModeRegistry::new(definitions(name)?)
}

/// Cisco IOS/IOS-XE: `Login` → `Enable` → `Config`.
///
/// The enable password is answered from the `enable_password` argument.
pub fn cisco(enable_password: &str) -> Result<ModeRegistry, CliError> {
    let mut defs = cisco_definitions();
    for def in &mut defs {
        if def.name == "Enable" {
            for action in &mut def.enter_action_map {
                action.reply = format!("{enable_password}\n");
            }
        }
    }
    ModeRegistry::new(defs)
}

fn cisco_definitions() -> Vec<ModeDefinition> {
    vec![
        ModeDefinition::new("Login", r"[^\s<#]+>\s*$"),
        ModeDefinition::new("Enable", r"[^\s#()]+#\s*$")
            .parent("Login")
            .enter("enable")
            .exit("disable")
            .action(r"(Enable )?Password:\s*$", "\n")
            .enter_action("terminal length 0")
            .setup("terminal width 511"),
        ModeDefinition::new("Config", r"\S+\(config[^)]*\)#\s*$")
            .parent("Enable")
            .enter("configure terminal")
            .exit("end"),
    ]
}

fn huawei_definitions() -> Vec<ModeDefinition> {
    vec![
        ModeDefinition::new("Enable", r"(RBM_P|RBM_S)?<[^>]+>\s*$")
            .enter_action("screen-length 0 temporary"),
        ModeDefinition::new("Config", r"(HRP_M|HRP_S)?\[[^\]]+\]\s*$")
            .parent("Enable")
            .enter("system-view")
            .exit("return"),
    ]
}

fn juniper_definitions() -> Vec<ModeDefinition> {
    vec![
        ModeDefinition::new("Enable", r"[\w.\-@]+>\s*$")
            .enter_action("set cli screen-length 0"),
        ModeDefinition::new("Config", r"[\w.\-@]+#\s*$")
            .parent("Enable")
            .enter("configure")
            .exit("exit configuration-mode")
            .action(r"Exit with uncommitted changes\? \[yes,no\]", "yes\n"),
    ]
}

#[cfg(test)]
mod tests {
    use super::{BUILTIN_TEMPLATES, by_name, cisco};
    use crate::error::CliError;
    use crate::router::identify_prompt;

    #[test]
    fn every_builtin_template_builds_a_clean_tree() {
        for name in BUILTIN_TEMPLATES {
            let registry = by_name(name).expect("template should build");
            assert!(registry.ambiguous_prompts().is_empty(), "{name}");
        }
    }

    #[test]
    fn unknown_template_is_reported() {
        let err = match by_name("nokia") {
            Ok(_) => panic!("unknown template should fail"),
            Err(err) => err,
        };
        assert!(matches!(err, CliError::TemplateNotFound(name) if name == "nokia"));
    }

    #[test]
    fn cisco_prompts_identify_each_mode() {
        let registry = cisco("secret").expect("template should build");
        let name = |line: &str| identify_prompt(&registry, line).map(|id| registry.name(id).to_string());

        assert_eq!(name("core-sw1>").as_deref(), Some("Login"));
        assert_eq!(name("core-sw1#").as_deref(), Some("Enable"));
        assert_eq!(name("core-sw1(config)#").as_deref(), Some("Config"));
        assert_eq!(name("core-sw1(config-if)#").as_deref(), Some("Config"));
    }

    #[test]
    fn huawei_prompts_identify_each_mode() {
        let registry = by_name("HUAWEI").expect("case-insensitive lookup");
        let name = |line: &str| identify_prompt(&registry, line).map(|id| registry.name(id).to_string());

        assert_eq!(name("<FW-01>").as_deref(), Some("Enable"));
        assert_eq!(name("HRP_M[FW-01]").as_deref(), Some("Config"));
    }
}
