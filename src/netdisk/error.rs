// PCS 结构化错误与错误分类
//
// 所有 PCS 接口调用都返回 PcsError，包含：
// - 错误类别（网络 / 远端 / 解析 / 本地）
// - HTTP 状态码（如有）
// - 远端错误码（仅远端错误）
// - 可读的错误信息
//
// 分类规则集中在 ErrorClassifier 中，远端错误码以查找表形式注入，便于单独测试

use crate::config::{RateControlConfig, RemoteCodeConfig};
use serde::Serialize;
use thiserror::Error;

/// 服务拒绝（请求过于频繁）
pub const PCS_REFUSE_SERVICE: i64 = 31034;

/// 文件不存在
pub const PCS_FILE_NOT_EXISTS: i64 = 31066;

/// superfile2 分片缺失（上传状态过期）
pub const PCS_BLOCK_MISS_IN_SUPERFILE: i64 = 31363;

/// 服务器错误：[Method:Insert][Error:Insert Request Forbid]
pub const PCS_INSERT_REQUEST_FORBID: i64 = 31200;

/// 请求实体过大的 HTTP 状态码
const HTTP_PAYLOAD_TOO_LARGE: u16 = 413;

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PcsErrorKind {
    /// 网络层错误（连接失败、超时、非 2xx 且无结构化错误体）
    Network,
    /// 远端返回的结构化错误（带 error_code）
    Remote,
    /// 响应无法解析
    Decode,
    /// 本地错误（构造请求失败等）
    Local,
}

/// PCS 接口错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PcsError {
    #[error("网络错误: {message}")]
    Network {
        status: Option<u16>,
        message: String,
    },

    #[error("远端错误 {code}: {message}")]
    Remote {
        code: i64,
        status: Option<u16>,
        message: String,
    },

    #[error("响应解析失败: {0}")]
    Decode(String),

    #[error("本地错误: {0}")]
    Local(String),
}

impl PcsError {
    /// 错误类别
    pub fn kind(&self) -> PcsErrorKind {
        match self {
            PcsError::Network { .. } => PcsErrorKind::Network,
            PcsError::Remote { .. } => PcsErrorKind::Remote,
            PcsError::Decode(_) => PcsErrorKind::Decode,
            PcsError::Local(_) => PcsErrorKind::Local,
        }
    }

    /// HTTP 状态码
    pub fn http_status(&self) -> Option<u16> {
        match self {
            PcsError::Network { status, .. } | PcsError::Remote { status, .. } => *status,
            _ => None,
        }
    }

    /// 远端错误码（仅远端错误有）
    pub fn remote_code(&self) -> Option<i64> {
        match self {
            PcsError::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// 是否为传输层超时
    pub fn is_timeout(&self) -> bool {
        let message = match self {
            PcsError::Network { message, .. } | PcsError::Local(message) => message,
            _ => return false,
        };
        let message = message.to_lowercase();
        message.contains("timed out") || message.contains("timeout")
    }

    /// 是否为请求实体过大
    pub fn is_payload_too_large(&self) -> bool {
        if self.http_status() == Some(HTTP_PAYLOAD_TOO_LARGE) {
            return true;
        }
        matches!(self, PcsError::Network { message, .. } if message.contains("413 Request Entity Too Large"))
    }

    /// 是否为文件不存在
    pub fn is_not_found(&self) -> bool {
        self.remote_code() == Some(PCS_FILE_NOT_EXISTS)
    }
}

impl From<reqwest::Error> for PcsError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_builder() {
            return PcsError::Local(e.to_string());
        }
        if e.is_decode() {
            return PcsError::Decode(e.to_string());
        }
        let message = if e.is_timeout() {
            format!("请求超时 (timeout): {}", e)
        } else {
            e.to_string()
        };
        PcsError::Network {
            status: e.status().map(|s| s.as_u16()),
            message,
        }
    }
}

/// 重试决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// 可重试
    Retry,
    /// 不可重试，立即失败
    Fatal,
}

/// 错误分类器
///
/// - 分片上传：按 HTTP 状态码分类
/// - 占位文件 / 合并分片：按远端错误码查找表分类
/// - 限流信号：网络类错误、服务拒绝错误码、传输超时
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    /// 合并时需要重试的远端错误码
    merge_retry_codes: Vec<i64>,
    /// 直接失败的远端错误码
    fatal_codes: Vec<i64>,
    /// 服务拒绝错误码
    refuse_service_code: i64,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self {
            merge_retry_codes: vec![PCS_BLOCK_MISS_IN_SUPERFILE, PCS_INSERT_REQUEST_FORBID],
            fatal_codes: Vec::new(),
            refuse_service_code: PCS_REFUSE_SERVICE,
        }
    }
}

impl ErrorClassifier {
    pub fn new(merge_retry_codes: Vec<i64>, fatal_codes: Vec<i64>, refuse_service_code: i64) -> Self {
        Self {
            merge_retry_codes,
            fatal_codes,
            refuse_service_code,
        }
    }

    /// 从配置创建
    pub fn from_config(codes: &RemoteCodeConfig, rate: &RateControlConfig) -> Self {
        Self::new(
            codes.merge_retry_codes.clone(),
            codes.fatal_codes.clone(),
            rate.refuse_service_code,
        )
    }

    /// 分片上传结果分类
    ///
    /// - 400/401/403/413：请求被拒、凭证无效或分片过大，不可重试
    /// - 本地错误：重试也不会改变结果
    /// - 其他状态码或传输错误：可重试
    pub fn chunk_decision(&self, error: &PcsError) -> RetryDecision {
        if let PcsError::Local(_) = error {
            return RetryDecision::Fatal;
        }
        match error.http_status() {
            Some(400 | 401 | 403 | 413) => RetryDecision::Fatal,
            _ => RetryDecision::Retry,
        }
    }

    /// 占位文件创建 / 合并分片结果分类
    ///
    /// 先查重试/致命错误码表，再按 413、400/401/403 和本地错误判定为不可重试
    pub fn commit_decision(&self, error: &PcsError) -> RetryDecision {
        if let Some(code) = error.remote_code() {
            if self.merge_retry_codes.contains(&code) || code == self.refuse_service_code {
                return RetryDecision::Retry;
            }
            if self.fatal_codes.contains(&code) {
                return RetryDecision::Fatal;
            }
        }
        if error.is_payload_too_large() {
            return RetryDecision::Fatal;
        }
        // 请求格式错误或凭证无效
        if matches!(error.http_status(), Some(400 | 401 | 403)) {
            return RetryDecision::Fatal;
        }
        match error.kind() {
            PcsErrorKind::Local => RetryDecision::Fatal,
            _ => RetryDecision::Retry,
        }
    }

    /// 是否为限流信号（用于驱动限流控制器）
    pub fn is_throttled(&self, error: &PcsError) -> bool {
        match error {
            PcsError::Network { .. } => true,
            PcsError::Remote { code, .. } => *code == self.refuse_service_code,
            other => other.is_timeout(),
        }
    }
}
