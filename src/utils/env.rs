// Configuration from environment variables

use std::{env, str::FromStr};

/// Reads a variable and parses it, falling back to a default
///
/// Missing variables and values that do not parse give `default_val`.
fn get_env_parsed<T: FromStr>(var_name: &str, default_val: T) -> T {
    env::var(var_name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default_val)
}

/// Reads a flag
///
/// # Arguments
///
/// * `var_name` - Variable name
/// * `default_val` - Value if missing or not recognized
///
/// # Return value
///
/// true for YES / TRUE, false for NO / FALSE (any case)
pub fn get_env_bool(var_name: &str, default_val: bool) -> bool {
    match env::var(var_name).map(|v| v.trim().to_uppercase()) {
        Ok(v) if v == "YES" || v == "TRUE" => true,
        Ok(v) if v == "NO" || v == "FALSE" => false,
        _ => default_val,
    }
}

/// Reads a string, or `default_val` if missing
pub fn get_env_string(var_name: &str, default_val: &str) -> String {
    env::var(var_name).unwrap_or_else(|_| default_val.to_string())
}

/// Reads an unsigned number, or `default_val` if missing or invalid
pub fn get_env_u32(var_name: &str, default_val: u32) -> u32 {
    get_env_parsed(var_name, default_val)
}

/// Reads a comma separated list
///
/// Items are trimmed and empty items are skipped.
/// A missing variable is an empty list.
pub fn get_env_list(var_name: &str) -> Vec<String> {
    get_env_string(var_name, "")
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_values() {
        env::set_var("SGS_TEST_ENV_BOOL", "yes");
        env::set_var("SGS_TEST_ENV_NUM", " 42 ");
        env::set_var("SGS_TEST_ENV_BAD_NUM", "many");
        env::set_var("SGS_TEST_ENV_LIST", "a, b,,c ");

        assert!(get_env_bool("SGS_TEST_ENV_BOOL", false));
        assert!(!get_env_bool("SGS_TEST_ENV_MISSING", false));
        assert_eq!(get_env_u32("SGS_TEST_ENV_NUM", 0), 42);
        assert_eq!(get_env_u32("SGS_TEST_ENV_BAD_NUM", 7), 7);
        assert_eq!(get_env_list("SGS_TEST_ENV_LIST"), vec!["a", "b", "c"]);
        assert!(get_env_list("SGS_TEST_ENV_MISSING").is_empty());
        assert_eq!(get_env_string("SGS_TEST_ENV_MISSING", "def"), "def");
    }
}
