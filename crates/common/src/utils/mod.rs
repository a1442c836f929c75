/// 工具函数集合

use uuid::Uuid;

/// 生成短 system_id（6 位小写字母数字），用于控制器与机器
pub fn generate_system_id() -> String {
    const ALPHABET: &[u8] = b"abcdefghjkmnpqrstuvwxyz23456789";
    let bytes = Uuid::new_v4().into_bytes();
    bytes
        .iter()
        .take(6)
        .map(|b| ALPHABET[*b as usize % ALPHABET.len()] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_system_id() {
        let id = generate_system_id();
        assert_eq!(id.len(), 6);
        assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}
