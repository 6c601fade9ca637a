use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A named value that can be substituted into a server's arguments as `!{name}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Variable {
    pub name: String,
    pub value: String,
    #[serde(default = "default_true")]
    pub for_commandline: bool,
}

impl Variable {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            for_commandline: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// One installable dedicated server. Immutable once the catalog is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppDefinition {
    pub name: String,
    /// Unique key used by `server create` and `app view`.
    pub short_name: String,
    /// Installer tool id (`app_update <id>`).
    pub catalog_id: u32,
    /// Executable relative to the server's working directory.
    pub executable_linux: String,
    #[serde(default)]
    pub executable_windows: Option<String>,
    /// Whitespace separated; double quotes group a single argument.
    #[serde(default)]
    pub default_args: String,
    #[serde(default)]
    pub variables: Vec<Variable>,
}

impl AppDefinition {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.name.trim().is_empty(), "app name must not be empty");
        let short = self.short_name.trim();
        anyhow::ensure!(!short.is_empty(), "app {:?}: short_name must not be empty", self.name);
        anyhow::ensure!(
            short.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
            "app {:?}: short_name {short:?} may only contain [A-Za-z0-9_-]",
            self.name
        );
        anyhow::ensure!(
            !self.executable_linux.trim().is_empty(),
            "app {short:?}: executable_linux must not be empty"
        );
        anyhow::ensure!(
            !std::path::Path::new(self.executable_linux.trim()).is_absolute(),
            "app {short:?}: executable_linux must be relative to the server directory"
        );
        for v in &self.variables {
            anyhow::ensure!(
                !v.name.trim().is_empty() && !v.name.contains('}'),
                "app {short:?}: invalid variable name {:?}",
                v.name
            );
        }
        Ok(())
    }

    pub fn default_arg_list(&self) -> Vec<String> {
        split_args(&self.default_args)
    }
}

/// Splits an argument line on whitespace. Double quotes group; they are not kept.
pub fn split_args(line: &str) -> Vec<String> {
    let mut out = vec![];
    let mut cur = String::new();
    let mut in_quotes = false;
    let mut has_token = false;
    for ch in line.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    out.push(std::mem::take(&mut cur));
                    has_token = false;
                }
            }
            c => {
                cur.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        out.push(cur);
    }
    out
}

/// Replaces every `!{name}` whose variable is marked for the command line.
/// Unknown placeholders are left as they are.
pub fn substitute(arg: &str, variables: &[Variable]) -> String {
    let mut out = arg.to_string();
    for v in variables.iter().filter(|v| v.for_commandline) {
        let placeholder = format!("!{{{}}}", v.name);
        if out.contains(&placeholder) {
            out = out.replace(&placeholder, &v.value);
        }
    }
    out
}

/// Built-in entries plus any configured ones; a configured entry with the same
/// short name replaces the built-in.
#[derive(Debug, Clone)]
pub struct Catalog {
    apps: Vec<Arc<AppDefinition>>,
}

impl Catalog {
    pub fn new(extra: &[AppDefinition]) -> Self {
        let mut apps: Vec<Arc<AppDefinition>> = builtin_apps().into_iter().map(Arc::new).collect();
        for app in extra {
            let key = app.short_name.trim().to_ascii_lowercase();
            apps.retain(|a| a.short_name.to_ascii_lowercase() != key);
            apps.push(Arc::new(app.clone()));
        }
        Self { apps }
    }

    pub fn list(&self) -> &[Arc<AppDefinition>] {
        &self.apps
    }

    pub fn find(&self, short_name: &str) -> Option<Arc<AppDefinition>> {
        let key = short_name.trim();
        self.apps
            .iter()
            .find(|a| a.short_name.eq_ignore_ascii_case(key))
            .cloned()
    }
}

fn app(
    name: &str,
    short_name: &str,
    catalog_id: u32,
    linux: &str,
    windows: &str,
    args: &str,
    vars: &[(&str, &str)],
) -> AppDefinition {
    AppDefinition {
        name: name.to_string(),
        short_name: short_name.to_string(),
        catalog_id,
        executable_linux: linux.to_string(),
        executable_windows: Some(windows.to_string()),
        default_args: args.to_string(),
        variables: vars.iter().map(|(k, v)| Variable::new(*k, *v)).collect(),
    }
}

fn builtin_apps() -> Vec<AppDefinition> {
    vec![
        app(
            "Rust",
            "rust",
            258550,
            "RustDedicated",
            "RustDedicated.exe",
            "-batchmode +server.port !{port} +server.identity !{identity} +server.hostname \"!{hostname}\" +server.maxplayers !{maxplayers}",
            &[("port", "28015"), ("identity", "node"), ("hostname", "Rust Server"), ("maxplayers", "50")],
        ),
        app(
            "Counter-Strike: Source",
            "css",
            232330,
            "srcds_run",
            "srcds.exe",
            "-game cstrike -console -port !{port} +maxplayers !{maxplayers} +map !{map}",
            &[("port", "27015"), ("maxplayers", "24"), ("map", "de_dust2")],
        ),
        app(
            "Team Fortress 2",
            "tf2",
            232250,
            "srcds_run",
            "srcds.exe",
            "-game tf -console -port !{port} +maxplayers !{maxplayers} +map !{map}",
            &[("port", "27015"), ("maxplayers", "24"), ("map", "ctf_2fort")],
        ),
        app(
            "Garry's Mod",
            "gmod",
            4020,
            "srcds_run",
            "srcds.exe",
            "-game garrysmod -console -port !{port} +maxplayers !{maxplayers} +map !{map}",
            &[("port", "27015"), ("maxplayers", "16"), ("map", "gm_construct")],
        ),
        app(
            "Valheim",
            "valheim",
            896660,
            "valheim_server.x86_64",
            "valheim_server.exe",
            "-nographics -batchmode -name \"!{name}\" -port !{port} -world !{world} -password !{password}",
            &[("name", "Valheim Server"), ("port", "2456"), ("world", "Dedicated"), ("password", "changeme")],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_args_groups_quoted_words() {
        assert_eq!(
            split_args(r#"-a  +x "two words" "" z"#),
            vec!["-a", "+x", "two words", "", "z"]
        );
        assert!(split_args("   ").is_empty());
    }

    #[test]
    fn substitute_only_uses_commandline_variables() {
        let mut hidden = Variable::new("secret", "s3cr3t");
        hidden.for_commandline = false;
        let vars = vec![Variable::new("port", "28015"), hidden];
        assert_eq!(substitute("+server.port !{port}", &vars), "+server.port 28015");
        assert_eq!(substitute("!{secret}", &vars), "!{secret}");
        assert_eq!(substitute("!{missing}-!{port}", &vars), "!{missing}-28015");
    }

    #[test]
    fn builtin_catalog_is_valid_and_unique() {
        let cat = Catalog::new(&[]);
        let mut shorts: Vec<_> = cat.list().iter().map(|a| a.short_name.clone()).collect();
        for a in cat.list() {
            a.validate().unwrap();
        }
        shorts.sort();
        shorts.dedup();
        assert_eq!(shorts.len(), cat.list().len());
        assert_eq!(cat.find("RUST").unwrap().catalog_id, 258550);
    }

    #[test]
    fn configured_app_replaces_builtin() {
        let mut custom = app("My Rust", "rust", 258550, "run.sh", "run.bat", "", &[]);
        custom.executable_windows = None;
        let cat = Catalog::new(&[custom]);
        assert_eq!(cat.find("rust").unwrap().executable_linux, "run.sh");
        assert_eq!(cat.list().iter().filter(|a| a.short_name == "rust").count(), 1);
    }

    #[test]
    fn validate_rejects_absolute_executable() {
        let bad = app("x", "x", 1, "/usr/bin/x", "x.exe", "", &[]);
        assert!(bad.validate().is_err());
    }
}
