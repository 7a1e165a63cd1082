// PCS 客户端实现
//
// 封装上传核心需要的 PCS 文件接口：
// - method=upload&type=tmpfile  上传临时分片
// - method=createsuperfile      合并分片
// - method=upload               整文件上传（占位文件 / 小文件）
// - method=delete               删除文件或目录

use crate::config::PcsConfig;
use crate::netdisk::{
    DeleteItem, DeleteParam, FileMeta, PcsApi, PcsError, PcsErrorBody, SuperFileParam,
    TmpFileResponse,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::cookie::Jar;
use reqwest::header::USER_AGENT;
use reqwest::multipart;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 响应体日志截断长度
const BODY_LOG_LIMIT: usize = 256;

/// 百度 PCS 客户端
#[derive(Debug, Clone)]
pub struct PcsClient {
    /// 普通接口客户端（带超时）
    client: Client,
    /// 分片上传客户端（不设超时，大分片在慢速网络下可能持续很久）
    upload_client: Client,
    /// PCS 服务地址，如 https://pcs.baidu.com
    base_url: String,
    /// 应用 ID
    app_id: u32,
    /// User-Agent
    user_agent: String,
}

impl PcsClient {
    /// 创建新的 PCS 客户端
    pub fn new(config: &PcsConfig) -> Result<Self> {
        let base_url = config.pcs_base_url.trim_end_matches('/').to_string();
        let url = base_url
            .parse::<reqwest::Url>()
            .with_context(|| format!("PCS 服务地址无效: {}", base_url))?;

        // 两个客户端共享同一个 Cookie Jar
        let jar = Arc::new(Jar::default());
        jar.add_cookie_str(&format!("BDUSS={}; Path=/", config.bduss), &url);
        if !config.stoken.is_empty() {
            jar.add_cookie_str(&format!("STOKEN={}; Path=/", config.stoken), &url);
        }

        let client = Client::builder()
            .cookie_provider(Arc::clone(&jar))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("创建 HTTP 客户端失败")?;
        let upload_client = Client::builder()
            .cookie_provider(jar)
            .build()
            .context("创建分片上传 HTTP 客户端失败")?;

        info!(
            "初始化 PCS 客户端: base_url={}, app_id={}, STOKEN={}",
            config.pcs_base_url,
            config.app_id,
            if config.stoken.is_empty() {
                "未设置"
            } else {
                "已设置"
            }
        );

        Ok(Self {
            client,
            upload_client,
            base_url,
            app_id: config.app_id,
            user_agent: config.user_agent.clone(),
        })
    }

    /// 拼接 PCS 文件接口地址
    fn file_url(&self, method: &str, extra: &[(&str, &str)]) -> String {
        let mut url = format!(
            "{}/rest/2.0/pcs/file?method={}&app_id={}",
            self.base_url, method, self.app_id
        );
        for (key, value) in extra {
            url.push('&');
            url.push_str(key);
            url.push('=');
            url.push_str(&urlencoding::encode(value));
        }
        url
    }

    /// 发送请求，返回状态码和响应体
    async fn execute(&self, request: RequestBuilder, op: &str) -> Result<(StatusCode, String), PcsError> {
        let response = request
            .header(USER_AGENT, &self.user_agent)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        debug!("{} 响应: status={}, body={}", op, status, truncate(&body));

        Ok((status, body))
    }
}

#[async_trait]
impl PcsApi for PcsClient {
    async fn upload_tmp_chunk(&self, remote_path: &str, data: &[u8]) -> Result<String, PcsError> {
        debug!("上传临时分片: path={}, size={}", remote_path, data.len());

        let url = self.file_url("upload", &[("type", "tmpfile")]);
        let part = multipart::Part::bytes(data.to_vec())
            .file_name("file")
            .mime_str("application/octet-stream")?;
        let form = multipart::Form::new().part("uploadedfile", part);

        let (status, body) = self
            .execute(self.upload_client.post(&url).multipart(form), "上传临时分片")
            .await?;

        let response: TmpFileResponse = decode_response(status, &body)?;
        if response.md5.is_empty() {
            return Err(PcsError::Decode(format!(
                "临时分片响应缺少 md5: {}",
                truncate(&body)
            )));
        }

        Ok(response.md5)
    }

    async fn create_super_file(
        &self,
        remote_path: &str,
        block_list: &[String],
    ) -> Result<FileMeta, PcsError> {
        info!(
            "合并分片: path={}, 分片数={}",
            remote_path,
            block_list.len()
        );

        let url = self.file_url(
            "createsuperfile",
            &[("path", remote_path), ("ondup", "overwrite")],
        );
        let param = serde_json::to_string(&SuperFileParam { block_list })
            .map_err(|e| PcsError::Local(format!("序列化 block_list 失败: {}", e)))?;

        let (status, body) = self
            .execute(self.client.post(&url).form(&[("param", param)]), "合并分片")
            .await?;

        decode_response(status, &body)
    }

    async fn upload_file(&self, remote_path: &str, data: &[u8]) -> Result<FileMeta, PcsError> {
        debug!("整文件上传: path={}, size={}", remote_path, data.len());

        let url = self.file_url("upload", &[("path", remote_path), ("ondup", "overwrite")]);
        let part = multipart::Part::bytes(data.to_vec())
            .file_name("file")
            .mime_str("application/octet-stream")?;
        let form = multipart::Form::new().part("file", part);

        let (status, body) = self
            .execute(self.upload_client.post(&url).multipart(form), "整文件上传")
            .await?;

        decode_response(status, &body)
    }

    async fn remove(&self, remote_paths: &[String]) -> Result<(), PcsError> {
        info!("删除: {:?}", remote_paths);

        let url = self.file_url("delete", &[]);
        let param = DeleteParam {
            list: remote_paths
                .iter()
                .map(|path| DeleteItem {
                    path: path.as_str(),
                })
                .collect(),
        };
        let param = serde_json::to_string(&param)
            .map_err(|e| PcsError::Local(format!("序列化删除参数失败: {}", e)))?;

        let (status, body) = self
            .execute(self.client.post(&url).form(&[("param", param)]), "删除")
            .await?;

        let _: serde_json::Value = decode_response(status, &body)?;
        Ok(())
    }
}

/// 解析 PCS 响应
///
/// 优先识别结构化错误体（error_code != 0），其次是非 2xx 状态码，最后解析目标类型
pub(crate) fn decode_response<T: DeserializeOwned>(status: StatusCode, body: &str) -> Result<T, PcsError> {
    if let Ok(error_body) = serde_json::from_str::<PcsErrorBody>(body) {
        if error_body.is_error() {
            warn!(
                "PCS 返回错误: status={}, error_code={}, error_msg={}, request_id={}",
                status, error_body.error_code, error_body.error_msg, error_body.request_id
            );
            return Err(PcsError::Remote {
                code: error_body.error_code,
                status: Some(status.as_u16()),
                message: error_body.error_msg,
            });
        }
    }

    if !status.is_success() {
        return Err(PcsError::Network {
            status: Some(status.as_u16()),
            message: format!("HTTP {}", status),
        });
    }

    serde_json::from_str(body)
        .map_err(|e| PcsError::Decode(format!("{}: body={}", e, truncate(body))))
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(BODY_LOG_LIMIT) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header_regex, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base_url: String) -> PcsConfig {
        PcsConfig {
            bduss: "test_bduss".to_string(),
            stoken: "test_stoken".to_string(),
            pcs_base_url: base_url,
            ..PcsConfig::default()
        }
    }

    #[test]
    fn test_decode_remote_error() {
        let err = decode_response::<FileMeta>(
            StatusCode::BAD_REQUEST,
            r#"{"error_code":31363,"error_msg":"block miss in superfile2"}"#,
        )
        .unwrap_err();
        assert_eq!(err.remote_code(), Some(31363));
        assert_eq!(err.http_status(), Some(400));
    }

    #[test]
    fn test_decode_plain_http_error() {
        let err = decode_response::<FileMeta>(StatusCode::PAYLOAD_TOO_LARGE, "<html></html>")
            .unwrap_err();
        assert_eq!(err.http_status(), Some(413));
        assert!(err.is_payload_too_large());
    }

    #[test]
    fn test_decode_garbage_success() {
        let err = decode_response::<FileMeta>(StatusCode::OK, "not json").unwrap_err();
        assert!(matches!(err, PcsError::Decode(_)));
    }

    #[test]
    fn test_file_url_encodes_path() {
        let client = PcsClient::new(&test_config("https://pcs.example.com/".to_string())).unwrap();
        let url = client.file_url("upload", &[("path", "/a b/c.txt")]);
        assert_eq!(
            url,
            "https://pcs.example.com/rest/2.0/pcs/file?method=upload&app_id=266719&path=%2Fa%20b%2Fc.txt"
        );
    }

    #[tokio::test]
    async fn test_upload_tmp_chunk_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/2.0/pcs/file"))
            .and(query_param("method", "upload"))
            .and(query_param("type", "tmpfile"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"md5":"0cc175b9c0f1b6a831c399e269772661","request_id":1}"#),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = PcsClient::new(&test_config(server.uri())).unwrap();
        let md5 = client.upload_tmp_chunk("/a.bin", b"a").await.unwrap();
        assert_eq!(md5, "0cc175b9c0f1b6a831c399e269772661");
    }

    #[tokio::test]
    async fn test_requests_carry_credential_cookies() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/2.0/pcs/file"))
            .and(query_param("type", "tmpfile"))
            .and(header_regex("cookie", "BDUSS=test_bduss"))
            .and(header_regex("cookie", "STOKEN=test_stoken"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"md5":"abc"}"#))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rest/2.0/pcs/file"))
            .and(query_param("method", "delete"))
            .and(header_regex("cookie", "BDUSS=test_bduss"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"request_id":1}"#))
            .expect(1)
            .mount(&server)
            .await;

        let client = PcsClient::new(&test_config(server.uri())).unwrap();
        assert_eq!(client.upload_tmp_chunk("/a.bin", b"a").await.unwrap(), "abc");
        client.remove(&["/a.bin".to_string()]).await.unwrap();
    }

    #[tokio::test]
    async fn test_upload_tmp_chunk_rejected_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/2.0/pcs/file"))
            .respond_with(ResponseTemplate::new(413))
            .mount(&server)
            .await;

        let client = PcsClient::new(&test_config(server.uri())).unwrap();
        let err = client.upload_tmp_chunk("/a.bin", b"abc").await.unwrap_err();
        assert_eq!(err.http_status(), Some(413));
    }

    #[tokio::test]
    async fn test_create_super_file_sends_block_list() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/2.0/pcs/file"))
            .and(query_param("method", "createsuperfile"))
            .and(query_param("path", "/dir/big.bin"))
            .and(query_param("ondup", "overwrite"))
            .and(body_string_contains("block_list"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"path":"/dir/big.bin","size":12,"ctime":1,"mtime":2,"md5":"x","fs_id":42}"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let client = PcsClient::new(&test_config(server.uri())).unwrap();
        let meta = client
            .create_super_file("/dir/big.bin", &["m0".to_string(), "m1".to_string()])
            .await
            .unwrap();
        assert_eq!(meta.size, 12);
        assert_eq!(meta.fs_id, 42);
    }

    #[tokio::test]
    async fn test_remove_remote_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/2.0/pcs/file"))
            .and(query_param("method", "delete"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"error_code":31034,"error_msg":"hit frequence limit"}"#),
            )
            .mount(&server)
            .await;

        let client = PcsClient::new(&test_config(server.uri())).unwrap();
        let err = client.remove(&["/gone".to_string()]).await.unwrap_err();
        assert_eq!(err.remote_code(), Some(31034));
    }
}
