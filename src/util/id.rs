use uuid::Uuid;

/// 每个入站请求一个短 ID，用于串联同一请求的多次上游尝试日志。
pub fn request_id() -> String {
    let s = Uuid::new_v4().simple().to_string();
    format!("req-{}", &s[..12])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_has_prefix_and_is_unique() {
        let a = request_id();
        let b = request_id();
        assert!(a.starts_with("req-"));
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }
}
