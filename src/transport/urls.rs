//! JSON API URL layout

use crate::path::quote;

/// Base URLs for one backend endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiUrls {
    endpoint: String,
}

impl ApiUrls {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// `{endpoint}/storage/v1/b`
    pub fn buckets(&self) -> String {
        format!("{}/storage/v1/b", self.endpoint)
    }

    pub fn bucket(&self, bucket: &str) -> String {
        format!("{}/{}", self.buckets(), quote(bucket))
    }

    pub fn objects(&self, bucket: &str) -> String {
        format!("{}/o", self.bucket(bucket))
    }

    pub fn object(&self, bucket: &str, key: &str) -> String {
        format!("{}/{}", self.objects(bucket), quote(key))
    }

    pub fn folders(&self, bucket: &str) -> String {
        format!("{}/folders", self.bucket(bucket))
    }

    pub fn folder(&self, bucket: &str, key: &str) -> String {
        format!("{}/{}", self.folders(bucket), quote(key))
    }

    pub fn storage_layout(&self, bucket: &str) -> String {
        format!("{}/storageLayout", self.bucket(bucket))
    }

    /// Media upload target for `bucket`
    pub fn upload(&self, bucket: &str) -> String {
        format!(
            "{}/upload/storage/v1/b/{}/o",
            self.endpoint,
            quote(bucket)
        )
    }

    /// Batch endpoint; sub-requests use paths relative to the host
    pub fn batch(&self) -> String {
        format!("{}/batch/storage/v1", self.endpoint)
    }

    /// Media download link for one object
    pub fn download(&self, bucket: &str, key: &str) -> String {
        format!(
            "{}/download/storage/v1/b/{}/o/{}?alt=media",
            self.endpoint,
            quote(bucket),
            quote(key)
        )
    }

    /// Server-side copy of `src` onto `dst`
    pub fn rewrite(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> String {
        format!(
            "{}/rewriteTo/b/{}/o/{}",
            self.object(src_bucket, src_key),
            quote(dst_bucket),
            quote(dst_key)
        )
    }

    pub fn compose(&self, bucket: &str, key: &str) -> String {
        format!("{}/compose", self.object(bucket, key))
    }

    /// Folder rename on hierarchical buckets
    pub fn rename_folder(&self, bucket: &str, src: &str, dst: &str) -> String {
        format!("{}/renameTo/folders/{}", self.folder(bucket, src), quote(dst))
    }

    pub fn operation(&self, bucket: &str, id: &str) -> String {
        format!("{}/operations/{}", self.bucket(bucket), quote(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_quote_segments() {
        let urls = ApiUrls::new("http://localhost:4443/");
        assert_eq!(
            urls.object("bkt", "a/b c.txt"),
            "http://localhost:4443/storage/v1/b/bkt/o/a%2Fb%20c.txt"
        );
        assert_eq!(
            urls.upload("bkt"),
            "http://localhost:4443/upload/storage/v1/b/bkt/o"
        );
        assert_eq!(urls.batch(), "http://localhost:4443/batch/storage/v1");
    }

    #[test]
    fn test_rewrite_and_folder_urls() {
        let urls = ApiUrls::new("http://localhost");
        assert_eq!(
            urls.rewrite("a", "x/1", "b", "y/2"),
            "http://localhost/storage/v1/b/a/o/x%2F1/rewriteTo/b/b/o/y%2F2"
        );
        assert_eq!(
            urls.rename_folder("bkt", "old/", "new/"),
            "http://localhost/storage/v1/b/bkt/folders/old%2F/renameTo/folders/new%2F"
        );
        assert_eq!(
            urls.download("bkt", "k"),
            "http://localhost/download/storage/v1/b/bkt/o/k?alt=media"
        );
    }
}
