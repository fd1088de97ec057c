//! TLS 证书加载与自签名生成。

use axum_server::tls_rustls::RustlsConfig;
use rcgen::generate_simple_self_signed;
use std::net::IpAddr;
use tracing::info;

/// 构建 Rustls 配置；未提供证书时在内存中生成自签名证书。
pub async fn build_rustls_config(
    tls_cert: Option<&str>,
    tls_key: Option<&str>,
    host: IpAddr,
) -> Result<RustlsConfig, std::io::Error> {
    if let (Some(cert), Some(key)) = (tls_cert, tls_key) {
        return RustlsConfig::from_pem_file(cert, key).await;
    }

    let (cert, key) = self_signed_pem(host)?;
    info!(%host, "using generated self-signed certificate");
    RustlsConfig::from_pem(cert, key).await
}

fn self_signed_pem(host: IpAddr) -> Result<(Vec<u8>, Vec<u8>), std::io::Error> {
    let mut names = vec!["localhost".to_string()];
    if !host.is_unspecified() {
        names.push(host.to_string());
    }
    let cert =
        generate_simple_self_signed(names).map_err(|err| std::io::Error::other(err.to_string()))?;
    Ok((
        cert.cert.pem().into_bytes(),
        cert.key_pair.serialize_pem().into_bytes(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn self_signed_pem_is_generated() {
        let (cert, key) = self_signed_pem(IpAddr::V4(Ipv4Addr::LOCALHOST)).expect("pem");
        assert!(String::from_utf8_lossy(&cert).contains("BEGIN CERTIFICATE"));
        assert!(String::from_utf8_lossy(&key).contains("PRIVATE KEY"));
    }
}
