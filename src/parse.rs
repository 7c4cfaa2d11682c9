use anyhow::Result;

use crate::profile::AuthMethodKind;

/// `user@host[:port]`, with `[v6addr]:port` accepted for IPv6 literals.
pub fn parse_remote_host(input: &str) -> Result<(String, String, u16)> {
    let at_pos =
        input.rfind('@').ok_or_else(|| anyhow::anyhow!("缺少用户名，例如 user@host[:port]"))?;
    let (user_part, host_part) = input.split_at(at_pos);
    let user = user_part.trim();
    let host_port = host_part[1..].trim(); // skip '@'
    if user.is_empty() || host_port.is_empty() {
        return Err(anyhow::anyhow!("用户名或主机为空"));
    }

    if let Some(rest) = host_port.strip_prefix('[') {
        let (host, tail) =
            rest.split_once(']').ok_or_else(|| anyhow::anyhow!("IPv6 地址缺少 ']': {}", host_port))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().map_err(|_| anyhow::anyhow!("端口无效: {}", p))?,
            None if tail.is_empty() => 22,
            None => return Err(anyhow::anyhow!("主机格式无效: {}", host_port)),
        };
        return Ok((user.to_string(), host.to_string(), port));
    }

    // 支持 host:port，否则默认 22
    let (host, port) = if let Some(colon) = host_port.rfind(':') {
        let (h, p_str) = host_port.split_at(colon);
        let p_str = &p_str[1..]; // skip ':'
        let p: u16 = p_str.parse().map_err(|_| anyhow::anyhow!("端口无效: {}", p_str))?;
        (h.to_string(), p)
    } else {
        (host_port.to_string(), 22)
    };
    if host.is_empty() {
        return Err(anyhow::anyhow!("用户名或主机为空"));
    }

    Ok((user.to_string(), host, port))
}

/// Comma separated method list, e.g. `key,password`.
pub fn parse_auth_order(input: &str) -> Result<Vec<AuthMethodKind>> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<AuthMethodKind>().map_err(|e| anyhow::anyhow!("{}", e)))
        .collect()
}
