//! Cache key derivation.
//!
//! Keys must be injective per query name: identical arguments produce the
//! same key and different argument vectors never collide. Each argument is
//! length-prefixed so plain concatenation cannot alias (`["ab", "c"]` and
//! `["a", "bc"]` differ).

/// Derive the cache key for one query invocation.
pub fn query_key(query: &str, args: &[&str]) -> String {
    let mut key = String::with_capacity(
        query.len() + args.iter().map(|arg| arg.len() + 4).sum::<usize>(),
    );
    key.push_str(query);
    for arg in args {
        key.push(':');
        key.push_str(&arg.len().to_string());
        key.push(':');
        key.push_str(arg);
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Identical arguments always derive the identical key.
    #[test]
    fn test_deterministic() {
        assert_eq!(
            query_key("echo_string", &["hello"]),
            query_key("echo_string", &["hello"]),
        );
        assert_eq!(query_key("echo_string", &["hello"]), "echo_string:5:hello");
    }

    /// Argument boundaries cannot alias thanks to the length prefix.
    #[test]
    fn test_boundaries_do_not_alias() {
        assert_ne!(query_key("q", &["ab", "c"]), query_key("q", &["a", "bc"]));
        assert_ne!(query_key("q", &["a:1:b"]), query_key("q", &["a", "b"]));
        assert_ne!(query_key("q", &[""]), query_key("q", &[]));
    }

    /// Distinct query names never share keys for equal arguments.
    #[test]
    fn test_query_name_disambiguates() {
        assert_ne!(query_key("echo_string", &["1"]), query_key("sum_int", &["1"]));
    }
}
