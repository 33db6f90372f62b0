pub mod env;
pub mod retry;
pub mod telemetry;

/// Performs `&str` comparisons in constant time so a mismatch position can't be recovered from
/// response timings
pub fn constant_time_cmp(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let res = a
        .as_bytes()
        .iter()
        .zip(b.as_bytes())
        .fold(0u8, |acc, (l, r)| {
            acc | (std::hint::black_box(*l) ^ std::hint::black_box(*r))
        });

    std::hint::black_box(res) == 0
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_const_time_cmp() {
        let expects = "test_token";
        let passing = "test_token";

        let bad_start = "__st_token";
        let bad_end = "test_tok__";

        let short = "test_toke";
        let long = "test_token_";

        assert!(constant_time_cmp(expects, passing));
        assert!(!constant_time_cmp(expects, bad_start));
        assert!(!constant_time_cmp(expects, bad_end));
        assert!(!constant_time_cmp(expects, short));
        assert!(!constant_time_cmp(expects, long));
        assert!(constant_time_cmp("", ""));
    }
}
