use std::path::{Path, PathBuf};

use crate::config::CONFIG_FILE_NAME;

/// Prefer the rustup-managed cargo over whatever `cargo` resolves to on PATH.
///
/// Any other program is returned unchanged.
pub fn resolve_program(program: &str) -> String {
    resolve_program_with_home(program, dirs::home_dir().as_deref())
}

pub fn resolve_program_with_home(program: &str, home: Option<&Path>) -> String {
    if program != "cargo" {
        return program.to_string();
    }
    let Some(home) = home else {
        return program.to_string();
    };
    let exe = if cfg!(windows) { "cargo.exe" } else { "cargo" };
    let candidate = home.join(".cargo").join("bin").join(exe);
    if candidate.is_file() {
        candidate.to_string_lossy().to_string()
    } else {
        program.to_string()
    }
}

/// On Windows, tools like `npm` are `.cmd` shims that cannot be started
/// directly, so commands go through `cmd /C`. Elsewhere argv is unchanged.
pub fn platform_argv(argv: &[String]) -> Vec<String> {
    if cfg!(windows) {
        let mut wrapped = vec!["cmd".to_string(), "/C".to_string()];
        wrapped.extend(argv.iter().cloned());
        wrapped
    } else {
        argv.to_vec()
    }
}

/// Where to look for devloop.toml and which directory relative paths in it
/// are resolved against.
pub fn config_location(explicit: Option<&Path>, cwd: &Path) -> (PathBuf, PathBuf) {
    let file = match explicit {
        Some(p) if p.is_absolute() => p.to_path_buf(),
        Some(p) => cwd.join(p),
        None => cwd.join(CONFIG_FILE_NAME),
    };
    let dir = file
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| cwd.to_path_buf());
    (file, dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_cargo_programs_pass_through() {
        let home = tempfile::tempdir().unwrap();
        assert_eq!(resolve_program_with_home("npm", Some(home.path())), "npm");
    }

    #[test]
    fn cargo_prefers_home_install() {
        let home = tempfile::tempdir().unwrap();
        assert_eq!(resolve_program_with_home("cargo", Some(home.path())), "cargo");
        assert_eq!(resolve_program_with_home("cargo", None), "cargo");

        let bin = home.path().join(".cargo").join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let exe = bin.join(if cfg!(windows) { "cargo.exe" } else { "cargo" });
        std::fs::write(&exe, "").unwrap();
        assert_eq!(
            resolve_program_with_home("cargo", Some(home.path())),
            exe.to_string_lossy()
        );
    }

    #[cfg(unix)]
    #[test]
    fn platform_argv_is_unchanged_on_unix() {
        let argv = vec!["npm".to_string(), "run".to_string(), "dev".to_string()];
        assert_eq!(platform_argv(&argv), argv);
    }

    #[test]
    fn config_location_defaults_to_cwd() {
        let (file, dir) = config_location(None, Path::new("/work"));
        assert_eq!(file, PathBuf::from("/work/devloop.toml"));
        assert_eq!(dir, PathBuf::from("/work"));

        let (file, dir) = config_location(Some(Path::new("conf/dev.toml")), Path::new("/work"));
        assert_eq!(file, PathBuf::from("/work/conf/dev.toml"));
        assert_eq!(dir, PathBuf::from("/work/conf"));
    }
}
