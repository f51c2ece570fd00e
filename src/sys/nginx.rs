// src/sys/nginx.rs

/// Placeholder in the proxy template replaced by the rendered server blocks.
pub const SERVERS_PLACEHOLDER: &str = "@servers";

/// Where the certificate tree is mounted inside the proxy container.
pub const CERT_MOUNT: &str = "/etc/nginx/ssl";

/// Built-in template. Port 3000 forwards to the shim's own API.
pub const DEFAULT_TEMPLATE: &str = r#"worker_processes auto;

events {
    worker_connections 1024;
}

http {
    sendfile on;
    keepalive_timeout 65;
    client_max_body_size 105M;

    server {
        listen 3000;
        location / {
            proxy_pass http://bcms-shim:1279;
            proxy_set_header Host $host;
        }
    }
@servers
}
"#;

/// 🛡️ Zero-Trust: Strictly validates domain names to prevent config injection
pub fn validate_domain_format(domain: &str) -> Result<(), String> {
    if domain.is_empty() {
        return Err("Domain cannot be empty".to_string());
    }
    if domain.contains("..") || domain.contains('/') || domain.contains('\\') {
        return Err(format!("Zero-Trust: Path traversal detected in domain: '{}'", domain));
    }
    // Allow alphanumeric, dots, hyphens, underscores.
    // Reject everything else (including spaces, quotes, brackets, semicolons)
    if !domain.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_') {
        return Err(format!("Zero-Trust: Invalid characters in domain name: '{}'", domain));
    }
    Ok(())
}

/// Catch-all: anything that matches no domain gets a fixed 404.
pub fn render_default_block() -> String {
    r#"    server {
        listen 80 default_server;
        server_name _;
        return 404;
    }
"#
    .to_string()
}

pub fn render_http_block(domain: &str, ip: &str, port: u16) -> String {
    format!(
        r#"    server {{
        listen 80;
        server_name {domain};

        location / {{
{location}
        }}
    }}
"#,
        domain = domain,
        location = location_body(ip, port)
    )
}

pub fn render_https_block(domain: &str, ip: &str, port: u16) -> String {
    format!(
        r#"    server {{
        listen 443 ssl;
        server_name {domain};
        ssl_certificate {mount}/{domain}/crt;
        ssl_certificate_key {mount}/{domain}/key;

        location / {{
{location}
        }}
    }}
"#,
        domain = domain,
        mount = CERT_MOUNT,
        location = location_body(ip, port)
    )
}

fn location_body(ip: &str, port: u16) -> String {
    format!(
        r#"            proxy_pass http://{ip}:{port};
            proxy_set_header Host $host;
            proxy_set_header X-Real-IP $remote_addr;
            proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
            add_header X-Content-Type-Options "nosniff" always;"#
    )
}

/// Splices the blocks into the template; a template without the placeholder
/// gets them appended before its final closing brace.
pub fn compose(template: &str, blocks: &str) -> String {
    if template.contains(SERVERS_PLACEHOLDER) {
        return template.replacen(SERVERS_PLACEHOLDER, blocks.trim_end_matches('\n'), 1);
    }
    match template.rfind('}') {
        Some(idx) => format!("{}{}\n{}", &template[..idx], blocks, &template[idx..]),
        None => format!("{template}\n{blocks}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_domain_format_valid() {
        assert!(validate_domain_format("example.com").is_ok());
        assert!(validate_domain_format("sub.example.com").is_ok());
        assert!(validate_domain_format("my-site.com").is_ok());
        assert!(validate_domain_format("under_score.com").is_ok());
        assert!(validate_domain_format("123.com").is_ok());
    }

    #[test]
    fn test_validate_domain_format_invalid() {
        // Injection attempts
        assert!(validate_domain_format("example.com;").is_err());
        assert!(validate_domain_format("example.com{").is_err());
        assert!(validate_domain_format("example.com}").is_err());
        assert!(validate_domain_format("example.com space").is_err());
        assert!(validate_domain_format("example.com\n").is_err());

        // Path traversal
        assert!(validate_domain_format("../foo").is_err());
        assert!(validate_domain_format("foo/bar").is_err());
        assert!(validate_domain_format("foo\\bar").is_err());

        // Empty
        assert!(validate_domain_format("").is_err());
    }

    #[test]
    fn test_http_and_https_blocks_differ_in_listener() {
        let http = render_http_block("foo.example.com", "10.0.0.2", 1280);
        assert!(http.contains("listen 80;"));
        assert!(http.contains("proxy_pass http://10.0.0.2:1280;"));
        assert!(!http.contains("ssl_certificate"));

        let https = render_https_block("foo.example.com", "10.0.0.2", 1280);
        assert!(https.contains("listen 443 ssl;"));
        assert!(https.contains("/etc/nginx/ssl/foo.example.com/key;"));
    }

    #[test]
    fn test_compose_with_and_without_placeholder() {
        let composed = compose("http {\n@servers\n}\n", "    server {}\n");
        assert_eq!(composed, "http {\n    server {}\n}\n");

        let appended = compose("http {\n}\n", "    server {}\n");
        assert_eq!(appended, "http {\n    server {}\n\n}\n");
    }
}
