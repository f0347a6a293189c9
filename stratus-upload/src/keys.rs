use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::UploadConfig;

/// Strategy for naming uploaded files
pub trait NamingPolicy: Send + Sync {
    /// Name a file is stored under, given the name the client sent
    fn assign_name(&self, original_filename: &str) -> String;
}

/// Default naming: sanitized lowercase stem, short unique suffix, original extension
#[derive(Debug, Clone, Default)]
pub struct DefaultNaming;

impl NamingPolicy for DefaultNaming {
    fn assign_name(&self, original_filename: &str) -> String {
        let base = original_filename
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(original_filename);

        let (stem, ext) = match base.rfind('.') {
            Some(pos) if pos > 0 => (&base[..pos], Some(&base[pos + 1..])),
            _ => (base, None),
        };

        let mut name = sanitize(stem);
        if name.is_empty() {
            name.push_str("file");
        }

        let suffix = Uuid::new_v4().simple().to_string();
        name.push('-');
        name.push_str(&suffix[..8]);

        if let Some(ext) = ext.map(sanitize).filter(|e| !e.is_empty()) {
            name.push('.');
            name.push_str(&ext);
        }
        name
    }
}

/// Keeps the client's filename (tests, migrations)
#[derive(Debug, Clone, Default)]
pub struct KeepOriginalName;

impl NamingPolicy for KeepOriginalName {
    fn assign_name(&self, original_filename: &str) -> String {
        original_filename.to_string()
    }
}

fn sanitize(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_dash = false;
    for c in s.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
            last_dash = false;
        } else if !last_dash && !out.is_empty() {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Where a request's files land
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadDirectory {
    /// `YYYY/MM/DD` of the request
    pub current_date: String,
    pub upload_dir: String,
    /// Directory keys are built under (honors the per-request override)
    pub upload_path_dir: String,
    /// Directory recorded on file records
    pub periodic_dir: String,
}

impl UploadDirectory {
    pub fn resolve(config: &UploadConfig, path_override: Option<&str>, now: DateTime<Utc>) -> Self {
        let current_date = now.format("%Y/%m/%d").to_string();
        let upload_dir = config.upload_directory.trim_end_matches('/').to_string();
        let dated = if config.include_timestamp_in_dir {
            join_key(&upload_dir, &current_date)
        } else {
            upload_dir.clone()
        };

        let upload_path_dir = match path_override {
            Some(dir) => dir.trim_end_matches('/').to_string(),
            None => dated.clone(),
        };

        Self {
            current_date,
            upload_dir,
            upload_path_dir,
            periodic_dir: dated,
        }
    }

    /// Destination key for an assigned filename
    pub fn object_key(&self, filename: &str) -> String {
        join_key(&self.upload_path_dir, filename)
    }
}

fn join_key(dir: &str, name: &str) -> String {
    let dir = dir.trim_matches('/');
    let name = name.trim_start_matches('/');
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn default_naming_keeps_extension_and_sanitizes() {
        let name = DefaultNaming.assign_name("My Holiday Photo!.JPG");
        assert!(name.starts_with("my-holiday-photo-"), "{}", name);
        assert!(name.ends_with(".jpg"), "{}", name);

        let a = DefaultNaming.assign_name("a.txt");
        let b = DefaultNaming.assign_name("a.txt");
        assert_ne!(a, b);
    }

    #[test]
    fn default_naming_strips_client_paths() {
        let name = DefaultNaming.assign_name("C:\\Users\\me\\..\\report.pdf");
        assert!(name.starts_with("report-"), "{}", name);
        assert!(!name.contains('/') && !name.contains('\\'));
    }

    #[test]
    fn default_naming_handles_dotfiles_and_empty_stems() {
        assert!(DefaultNaming.assign_name(".env").starts_with("env-"));
        assert!(DefaultNaming.assign_name("???").starts_with("file-"));
    }

    #[test]
    fn directory_includes_date_by_default() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap();
        let dir = UploadDirectory::resolve(&UploadConfig::default(), None, now);

        assert_eq!(dir.current_date, "2024/03/09");
        assert_eq!(dir.upload_path_dir, "clouduploads/2024/03/09");
        assert_eq!(dir.object_key("a.png"), "clouduploads/2024/03/09/a.png");
    }

    #[test]
    fn override_replaces_path_but_not_recorded_dir() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap();
        let config = UploadConfig::default().with_timestamp_in_dir(false);
        let dir = UploadDirectory::resolve(&config, Some("tenants/42/"), now);

        assert_eq!(dir.upload_path_dir, "tenants/42");
        assert_eq!(dir.periodic_dir, "clouduploads");
        assert_eq!(dir.object_key("a.png"), "tenants/42/a.png");
    }
}
