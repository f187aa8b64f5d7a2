/// 工具函数集合

use std::net::Ipv4Addr;
use uuid::Uuid;

/// 生成唯一 ID
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// 验证 IPv4 地址格式
pub fn validate_ip_address(ip: &str) -> bool {
    ip.parse::<Ipv4Addr>().is_ok()
}

/// 验证节点名称（DNS 主机名标签）
///
/// 1-63 个字符，仅小写字母、数字和连字符，不能以连字符开头或结尾
pub fn validate_host_label(name: &str) -> bool {
    if name.is_empty() || name.len() > 63 {
        return false;
    }
    if name.starts_with('-') || name.ends_with('-') {
        return false;
    }

    name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// 拼接主机名与 DNS 域
pub fn fqdn(host: &str, zone: &str) -> String {
    let zone = zone.trim_matches('.');
    if zone.is_empty() {
        host.to_string()
    } else {
        format!("{}.{}", host, zone)
    }
}
