// Copyright 2020 - 2021 Alex Dukhno
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Server-side session state: the table of run-time settings (GUCs) and the
//! per-connection cache of prepared statements and portals.

pub mod statement;

use query_parser::set::SetScope;
use std::collections::HashMap;

/// Vendor settings live under this namespace and are accepted even when they
/// are not predeclared
pub const VENDOR_NAMESPACE: &str = "spanner.";

/// Where the current value of a setting came from
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SettingSource {
    Default,
    Startup,
    Session,
    Local,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Setting {
    pub value: String,
    pub source: SettingSource,
    pub category: &'static str,
    /// reported settings are re-broadcast to the client on change
    pub reported: bool,
}

#[derive(Debug, PartialEq)]
pub enum SessionError {
    UnknownSetting(String),
}

/// The per-connection table of run-time settings.
///
/// Reads and writes are single-threaded per connection; `SET LOCAL` entries
/// are reverted when the surrounding transaction ends.
#[derive(Debug)]
pub struct SessionState {
    settings: HashMap<String, Setting>,
    defaults: HashMap<String, Setting>,
    local_undo: Vec<(String, Option<Setting>)>,
}

fn default_settings() -> HashMap<String, Setting> {
    fn setting(value: &str, category: &'static str, reported: bool) -> Setting {
        Setting {
            value: value.to_owned(),
            source: SettingSource::Default,
            category,
            reported,
        }
    }

    let mut settings = HashMap::new();
    settings.insert("server_version".to_owned(), setting("14.1", "server", true));
    settings.insert("server_encoding".to_owned(), setting("UTF8", "server", true));
    settings.insert("client_encoding".to_owned(), setting("UTF8", "client", true));
    settings.insert("application_name".to_owned(), setting("", "client", true));
    settings.insert("is_superuser".to_owned(), setting("false", "server", true));
    settings.insert("session_authorization".to_owned(), setting("", "server", true));
    settings.insert("integer_datetimes".to_owned(), setting("on", "server", true));
    settings.insert("datestyle".to_owned(), setting("ISO, YMD", "client", true));
    settings.insert("intervalstyle".to_owned(), setting("iso_8601", "client", true));
    settings.insert("standard_conforming_strings".to_owned(), setting("on", "server", true));
    settings.insert("timezone".to_owned(), setting("UTC", "client", true));
    settings.insert("search_path".to_owned(), setting("public", "client", false));
    settings.insert("statement_timeout".to_owned(), setting("0", "client", false));
    settings.insert("extra_float_digits".to_owned(), setting("1", "client", false));

    settings.insert("spanner.force_autocommit".to_owned(), setting("off", "vendor", false));
    settings.insert(
        "spanner.autocommit_dml_mode".to_owned(),
        setting("transactional", "vendor", false),
    );
    settings.insert(
        "spanner.ddl_transaction_mode".to_owned(),
        setting("single_statement", "vendor", false),
    );
    settings.insert("spanner.read_only_staleness".to_owned(), setting("strong", "vendor", false));
    settings.insert("spanner.statement_timeout".to_owned(), setting("0", "vendor", false));
    settings
}

impl Default for SessionState {
    fn default() -> SessionState {
        let defaults = default_settings();
        SessionState {
            settings: defaults.clone(),
            defaults,
            local_undo: vec![],
        }
    }
}

impl SessionState {
    /// Builds session state with startup parameters and `options=-c k=v`
    /// pairs applied before the first query
    pub fn from_startup(properties: &HashMap<String, String>) -> SessionState {
        let mut state = SessionState::default();
        for (key, value) in properties {
            match key.as_str() {
                "database" | "user" | "options" | "replication" => continue,
                _ => state.apply_startup(key, value),
            }
        }
        if let Some(user) = properties.get("user") {
            state.apply_startup("session_authorization", user);
        }
        if let Some(options) = properties.get("options") {
            for (key, value) in parse_options(options) {
                state.apply_startup(&key, &value);
            }
        }
        state
    }

    fn apply_startup(&mut self, name: &str, value: &str) {
        let key = name.to_lowercase();
        let entry = self.settings.entry(key).or_insert(Setting {
            value: String::new(),
            source: SettingSource::Startup,
            category: "client",
            reported: false,
        });
        entry.value = value.to_owned();
        entry.source = SettingSource::Startup;
    }

    /// Current value of a setting
    pub fn get(&self, name: &str) -> Option<&str> {
        self.settings.get(&name.to_lowercase()).map(|setting| setting.value.as_str())
    }

    /// `SHOW <name>`
    pub fn show(&self, name: &str) -> Result<String, SessionError> {
        let key = name.to_lowercase();
        match self.settings.get(&key) {
            Some(setting) => Ok(setting.value.clone()),
            None => Err(SessionError::UnknownSetting(name.to_owned())),
        }
    }

    /// `SHOW ALL`, sorted by name
    pub fn show_all(&self) -> Vec<(String, String)> {
        let mut all: Vec<(String, String)> = self
            .settings
            .iter()
            .map(|(name, setting)| (name.clone(), setting.value.clone()))
            .collect();
        all.sort();
        all
    }

    /// `SET [SESSION|LOCAL] <name>`. A `None` value means `DEFAULT`.
    /// Returns the names of reported settings whose value changed.
    pub fn set(&mut self, scope: SetScope, name: &str, value: Option<&str>) -> Result<Option<(String, String)>, SessionError> {
        let key = name.to_lowercase();
        if !self.settings.contains_key(&key) && !key.starts_with(VENDOR_NAMESPACE) {
            return Err(SessionError::UnknownSetting(name.to_owned()));
        }

        let previous = self.settings.get(&key).cloned();
        if scope == SetScope::Local {
            self.local_undo.push((key.clone(), previous.clone()));
        }

        let value = match value {
            Some(value) => value.to_owned(),
            None => match self.defaults.get(&key) {
                Some(default) => default.value.clone(),
                None => String::new(),
            },
        };

        let reported = previous.as_ref().map(|setting| setting.reported).unwrap_or(false);
        let changed = previous.as_ref().map(|setting| setting.value != value).unwrap_or(true);
        self.settings.insert(
            key.clone(),
            Setting {
                value: value.clone(),
                source: if scope == SetScope::Local {
                    SettingSource::Local
                } else {
                    SettingSource::Session
                },
                category: previous.as_ref().map(|setting| setting.category).unwrap_or("vendor"),
                reported,
            },
        );
        if reported && changed {
            Ok(Some((key, value)))
        } else {
            Ok(None)
        }
    }

    /// `RESET <name>`
    pub fn reset(&mut self, name: &str) -> Result<(), SessionError> {
        let key = name.to_lowercase();
        match self.defaults.get(&key) {
            Some(default) => {
                self.settings.insert(key, default.clone());
                Ok(())
            }
            None if key.starts_with(VENDOR_NAMESPACE) => {
                self.settings.remove(&key);
                Ok(())
            }
            None => Err(SessionError::UnknownSetting(name.to_owned())),
        }
    }

    /// `RESET ALL`
    pub fn reset_all(&mut self) {
        self.settings = self.defaults.clone();
        self.local_undo.clear();
    }

    /// Reverts `SET LOCAL` entries; called when a transaction commits or
    /// rolls back
    pub fn on_transaction_end(&mut self) {
        while let Some((key, previous)) = self.local_undo.pop() {
            match previous {
                Some(setting) => {
                    self.settings.insert(key, setting);
                }
                None => {
                    self.settings.remove(&key);
                }
            }
        }
    }

    /// Vendor knob: `spanner.force_autocommit`
    pub fn force_autocommit(&self) -> bool {
        matches!(self.get("spanner.force_autocommit"), Some("on") | Some("true"))
    }

    /// Vendor knob: `spanner.autocommit_dml_mode`
    pub fn partitioned_dml(&self) -> bool {
        self.get("spanner.autocommit_dml_mode") == Some("partitioned_non_atomic")
    }

    /// `spanner.statement_timeout` / `statement_timeout` in milliseconds;
    /// zero means no timeout
    pub fn statement_timeout_millis(&self) -> u64 {
        let vendor = self.get("spanner.statement_timeout").and_then(|value| value.parse().ok());
        let standard = self.get("statement_timeout").and_then(|value| value.parse().ok());
        vendor.filter(|millis| *millis > 0).or(standard).unwrap_or(0)
    }
}

fn parse_options(options: &str) -> Vec<(String, String)> {
    let mut pairs = vec![];
    let mut rest = options.trim();
    while let Some(at) = rest.find("-c") {
        rest = rest[at + 2..].trim_start();
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let pair = &rest[..end];
        if let Some(eq) = pair.find('=') {
            pairs.push((pair[..eq].to_owned(), pair[eq + 1..].to_owned()));
        }
        rest = &rest[end..];
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_visible() {
        let state = SessionState::default();
        assert_eq!(state.get("server_encoding"), Some("UTF8"));
        assert_eq!(state.get("TimeZone"), Some("UTC"));
        assert_eq!(state.get("spanner.autocommit_dml_mode"), Some("transactional"));
    }

    #[test]
    fn set_and_show_round_trip() {
        let mut state = SessionState::default();
        state.set(SetScope::Session, "application_name", Some("psql")).unwrap();
        assert_eq!(state.show("application_name").unwrap(), "psql");
    }

    #[test]
    fn unknown_setting_is_an_error() {
        let mut state = SessionState::default();
        assert_eq!(
            state.set(SetScope::Session, "no.such_thing", Some("1")),
            Err(SessionError::UnknownSetting("no.such_thing".to_owned()))
        );
        assert_eq!(
            state.show("no_such_thing"),
            Err(SessionError::UnknownSetting("no_such_thing".to_owned()))
        );
    }

    #[test]
    fn vendor_namespace_is_open() {
        let mut state = SessionState::default();
        state
            .set(SetScope::Session, "spanner.optimizer_version", Some("4"))
            .unwrap();
        assert_eq!(state.show("spanner.optimizer_version").unwrap(), "4");
    }

    #[test]
    fn set_local_reverts_on_transaction_end() {
        let mut state = SessionState::default();
        state.set(SetScope::Session, "TimeZone", Some("Europe/Kyiv")).unwrap();
        state.set(SetScope::Local, "TimeZone", Some("UTC")).unwrap();
        assert_eq!(state.get("timezone"), Some("UTC"));

        state.on_transaction_end();
        assert_eq!(state.get("timezone"), Some("Europe/Kyiv"));
    }

    #[test]
    fn set_session_survives_transaction_end() {
        let mut state = SessionState::default();
        state.set(SetScope::Session, "application_name", Some("app")).unwrap();
        state.on_transaction_end();
        assert_eq!(state.get("application_name"), Some("app"));
    }

    #[test]
    fn reset_restores_the_default() {
        let mut state = SessionState::default();
        state.set(SetScope::Session, "DateStyle", Some("German")).unwrap();
        state.reset("DateStyle").unwrap();
        assert_eq!(state.get("datestyle"), Some("ISO, YMD"));
    }

    #[test]
    fn reset_all_drops_session_changes() {
        let mut state = SessionState::default();
        state.set(SetScope::Session, "application_name", Some("app")).unwrap();
        state.set(SetScope::Session, "spanner.optimizer_version", Some("4")).unwrap();
        state.reset_all();
        assert_eq!(state.get("application_name"), Some(""));
        assert_eq!(state.get("spanner.optimizer_version"), None);
    }

    #[test]
    fn reported_settings_announce_changes() {
        let mut state = SessionState::default();
        let reported = state.set(SetScope::Session, "TimeZone", Some("Europe/Kyiv")).unwrap();
        assert_eq!(reported, Some(("timezone".to_owned(), "Europe/Kyiv".to_owned())));
        let unchanged = state.set(SetScope::Session, "search_path", Some("s")).unwrap();
        assert_eq!(unchanged, None);
    }

    #[test]
    fn startup_properties_applied_before_first_query() {
        let mut properties = HashMap::new();
        properties.insert("user".to_owned(), "admin".to_owned());
        properties.insert("application_name".to_owned(), "jdbc".to_owned());
        properties.insert("options".to_owned(), "-c TimeZone=UTC -c spanner.read_only_staleness=exact_staleness".to_owned());

        let state = SessionState::from_startup(&properties);
        assert_eq!(state.get("application_name"), Some("jdbc"));
        assert_eq!(state.get("session_authorization"), Some("admin"));
        assert_eq!(state.get("spanner.read_only_staleness"), Some("exact_staleness"));
    }

    #[test]
    fn show_all_is_sorted() {
        let state = SessionState::default();
        let all = state.show_all();
        let mut sorted = all.clone();
        sorted.sort();
        assert_eq!(all, sorted);
        assert!(all.iter().any(|(name, _)| name == "server_version"));
    }
}
