// PCS 接口响应类型

use serde::{Deserialize, Serialize};

/// 远端错误响应体
///
/// 示例：`{"error_code":31363,"error_msg":"block miss in superfile2","request_id":123}`
#[derive(Debug, Deserialize)]
pub struct PcsErrorBody {
    /// 错误码（0 或缺省表示成功）
    #[serde(default)]
    pub error_code: i64,

    /// 错误信息
    #[serde(default)]
    pub error_msg: String,

    /// 请求ID
    #[serde(default)]
    pub request_id: u64,
}

impl PcsErrorBody {
    pub fn is_error(&self) -> bool {
        self.error_code != 0
    }
}

/// 临时分片上传响应
#[derive(Debug, Deserialize)]
pub struct TmpFileResponse {
    /// 分片 MD5（合并时使用）
    #[serde(default)]
    pub md5: String,

    /// 请求ID
    #[serde(default)]
    pub request_id: u64,
}

/// 文件元信息（整文件上传、合并分片的返回值）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// 文件路径
    #[serde(default)]
    pub path: String,

    /// 文件大小
    #[serde(default)]
    pub size: u64,

    /// 服务器创建时间
    #[serde(default)]
    pub ctime: i64,

    /// 服务器修改时间
    #[serde(default)]
    pub mtime: i64,

    /// 文件 MD5
    #[serde(default)]
    pub md5: String,

    /// 文件服务器ID
    #[serde(default)]
    pub fs_id: u64,
}

/// 合并分片请求参数：`param={"block_list":[...]}`
#[derive(Debug, Serialize)]
pub struct SuperFileParam<'a> {
    pub block_list: &'a [String],
}

/// 删除请求中的单个路径
#[derive(Debug, Serialize)]
pub struct DeleteItem<'a> {
    pub path: &'a str,
}

/// 删除请求参数：`param={"list":[{"path":...}]}`
#[derive(Debug, Serialize)]
pub struct DeleteParam<'a> {
    pub list: Vec<DeleteItem<'a>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_superfile_param_shape() {
        let blocks = vec!["a".to_string(), "b".to_string()];
        let json = serde_json::to_string(&SuperFileParam {
            block_list: &blocks,
        })
        .unwrap();
        assert_eq!(json, r#"{"block_list":["a","b"]}"#);
    }

    #[test]
    fn test_delete_param_shape() {
        let param = DeleteParam {
            list: vec![DeleteItem { path: "/a" }, DeleteItem { path: "/b" }],
        };
        assert_eq!(
            serde_json::to_string(&param).unwrap(),
            r#"{"list":[{"path":"/a"},{"path":"/b"}]}"#
        );
    }

    #[test]
    fn test_error_body_defaults() {
        let body: PcsErrorBody = serde_json::from_str(r#"{"md5":"abc"}"#).unwrap();
        assert!(!body.is_error());

        let body: PcsErrorBody =
            serde_json::from_str(r#"{"error_code":31034,"error_msg":"refused"}"#).unwrap();
        assert!(body.is_error());
        assert_eq!(body.error_msg, "refused");
    }
}
