//! Environment-variable assembly for spawned children.
//!
//! Grounded on `wshd.c`'s `env__add`/`env__get`/`child_setup_environment`: a
//! request's environment is propagated as-is, then `HOME`/`USER` are always
//! overwritten, and `PATH` is added only when the request did not already
//! supply one.

const DEFAULT_PATH_ROOT: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
const DEFAULT_PATH_USER: &str = "/usr/local/bin:/usr/bin:/bin";

/// Returns the value of `key` in a `K=V` environment vector, if present.
pub fn get<'a>(env: &'a [String], key: &str) -> Option<&'a str> {
    let prefix_len = key.len() + 1;
    env.iter().find_map(|entry| {
        if entry.len() >= prefix_len && entry.starts_with(key) && entry.as_bytes()[key.len()] == b'=' {
            Some(&entry[prefix_len..])
        } else {
            None
        }
    })
}

/// Builds the final environment for a spawned process: the request's
/// environment, then `HOME`/`USER` forced to the resolved account, then
/// `PATH` propagated if present or defaulted by uid otherwise.
pub fn build(request_env: &[String], pw_dir: &str, pw_name: &str, uid: u32) -> Vec<String> {
    let mut env: Vec<String> = request_env.to_vec();
    env.push(format!("HOME={pw_dir}"));
    env.push(format!("USER={pw_name}"));

    match get(request_env, "PATH") {
        Some(path) => env.push(format!("PATH={path}")),
        None => {
            let default_path = if uid == 0 { DEFAULT_PATH_ROOT } else { DEFAULT_PATH_USER };
            env.push(format!("PATH={default_path}"));
        }
    }

    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_finds_matching_key() {
        let env = vec!["FOO=bar".to_string(), "PATH=/a:/b".to_string()];
        assert_eq!(get(&env, "PATH"), Some("/a:/b"));
        assert_eq!(get(&env, "MISSING"), None);
    }

    #[test]
    fn get_does_not_match_key_prefix() {
        let env = vec!["PATHOLOGICAL=x".to_string()];
        assert_eq!(get(&env, "PATH"), None);
    }

    #[test]
    fn get_treats_an_empty_value_as_present() {
        let env = vec!["PATH=".to_string()];
        assert_eq!(get(&env, "PATH"), Some(""));
    }

    #[test]
    fn build_defaults_path_for_root() {
        let env = build(&[], "/root", "root", 0);
        assert!(env.contains(&"HOME=/root".to_string()));
        assert!(env.contains(&"USER=root".to_string()));
        assert!(env.contains(&format!("PATH={DEFAULT_PATH_ROOT}")));
    }

    #[test]
    fn build_defaults_path_for_non_root() {
        let env = build(&[], "/home/vcap", "vcap", 1000);
        assert!(env.contains(&format!("PATH={DEFAULT_PATH_USER}")));
    }

    #[test]
    fn build_propagates_existing_path_without_duplicating() {
        let req_env = vec!["PATH=/custom".to_string()];
        let env = build(&req_env, "/home/vcap", "vcap", 1000);
        let path_entries: Vec<_> = env.iter().filter(|e| e.starts_with("PATH=")).collect();
        assert_eq!(path_entries, vec![&"PATH=/custom".to_string()]);
    }

    #[test]
    fn build_overwrites_home_and_user_from_request() {
        let req_env = vec!["HOME=/wrong".to_string(), "USER=wrong".to_string()];
        let env = build(&req_env, "/home/vcap", "vcap", 1000);
        let home_entries: Vec<_> = env.iter().filter(|e| e.starts_with("HOME=")).collect();
        assert_eq!(home_entries.last(), Some(&&"HOME=/home/vcap".to_string()));
    }
}
