/// 引导方式表
///
/// 按 RFC 4578 option 93 的架构号匹配，表顺序即匹配优先级。

use serde::Serialize;

/// 引导方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BootMethod {
    pub name: &'static str,
    /// option 93 架构号
    pub arch_octet: u16,
    pub bootloader: &'static str,
    /// 默认架构提示
    pub arch_hint: &'static str,
    /// HTTP 引导（option 60 需回显 `HTTPClient`）
    pub http: bool,
}

pub const BOOT_METHODS: &[BootMethod] = &[
    BootMethod {
        name: "pxe",
        arch_octet: 0x0000,
        bootloader: "lpxelinux.0",
        arch_hint: "i386/generic",
        http: false,
    },
    BootMethod {
        name: "uefi_amd64_tftp",
        arch_octet: 0x0007,
        bootloader: "bootx64.efi",
        arch_hint: "amd64/generic",
        http: false,
    },
    BootMethod {
        name: "uefi_ebc_tftp",
        arch_octet: 0x0009,
        bootloader: "bootx64.efi",
        arch_hint: "amd64/generic",
        http: false,
    },
    BootMethod {
        name: "uefi_arm64_tftp",
        arch_octet: 0x000B,
        bootloader: "bootaa64.efi",
        arch_hint: "arm64/generic",
        http: false,
    },
    BootMethod {
        name: "powernv",
        arch_octet: 0x000E,
        bootloader: "ppc64el/pxelinux.0",
        arch_hint: "ppc64el/generic",
        http: false,
    },
    BootMethod {
        name: "uefi_amd64_http",
        arch_octet: 0x0010,
        bootloader: "bootx64.efi",
        arch_hint: "amd64/generic",
        http: true,
    },
    BootMethod {
        name: "uefi_arm64_http",
        arch_octet: 0x0013,
        bootloader: "bootaa64.efi",
        arch_hint: "arm64/generic",
        http: true,
    },
    BootMethod {
        name: "s390x",
        arch_octet: 0x001F,
        bootloader: "boots390x.bin",
        arch_hint: "s390x/generic",
        http: false,
    },
];

pub fn find_by_name(name: &str) -> Option<&'static BootMethod> {
    BOOT_METHODS.iter().find(|m| m.name == name)
}

/// 去掉禁用的方式后，取第一个与客户端架构匹配的方式
///
/// 客户端没有 option 93 时视为传统 PXE（0x0000）。
pub fn select(client_arch: &[u16], disabled: &[String]) -> Option<&'static BootMethod> {
    let legacy = [0x0000u16];
    let wanted = if client_arch.is_empty() {
        &legacy[..]
    } else {
        client_arch
    };

    let candidates: Vec<&BootMethod> = BOOT_METHODS
        .iter()
        .filter(|m| !disabled.iter().any(|d| d == m.name))
        .collect();

    candidates
        .into_iter()
        .find(|m| wanted.contains(&m.arch_octet))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_by_arch() {
        assert_eq!(select(&[], &[]).unwrap().name, "pxe");
        assert_eq!(select(&[0x0007], &[]).unwrap().bootloader, "bootx64.efi");
        assert_eq!(select(&[0x000B], &[]).unwrap().name, "uefi_arm64_tftp");
        assert_eq!(select(&[0x001F], &[]).unwrap().bootloader, "boots390x.bin");
        assert!(select(&[0x0010], &[]).unwrap().http);
        assert!(select(&[0x00FF], &[]).is_none());
    }

    #[test]
    fn test_disabled_methods_are_skipped() {
        let disabled = vec!["pxe".to_string()];
        assert!(select(&[], &disabled).is_none());

        // 多个架构号时按表顺序取第一个未禁用的
        let disabled = vec!["uefi_amd64_tftp".to_string()];
        assert_eq!(select(&[0x0007, 0x0010], &disabled).unwrap().name, "uefi_amd64_http");
    }

    #[test]
    fn test_find_by_name() {
        assert_eq!(find_by_name("powernv").unwrap().arch_octet, 0x000E);
        assert!(find_by_name("windows").is_none());
    }
}
