//! 本地文件 I/O 的限流包装。

use crate::stream::StorageFile;
use faststr::FastStr;
use log::warn;
use std::io;

/// 限流协作者：在每次本地 I/O 之前被询问。
pub trait Throttle {
    /// 申请 `bytes` 字节、`ops` 次操作的额度。返回 `false` 表示资源耗尽。
    fn apply(&self, bytes: u64, ops: u32, user: &str) -> bool;
}

/// 对所有请求都放行的限流器。
#[derive(Debug, Clone, Copy, Default)]
pub struct Unlimited;

impl Throttle for Unlimited {
    fn apply(&self, _bytes: u64, _ops: u32, _user: &str) -> bool {
        true
    }
}

/// 在每次读写之前咨询 `Throttle` 的存储文件。
pub struct ThrottledFile<F, T> {
    inner: F,
    throttle: T,
    user: FastStr,
}

impl<F: StorageFile, T: Throttle> ThrottledFile<F, T> {
    pub fn new(inner: F, throttle: T, user: impl Into<FastStr>) -> Self {
        Self {
            inner,
            throttle,
            user: user.into(),
        }
    }

    pub fn into_inner(self) -> F {
        self.inner
    }

    pub fn get_ref(&self) -> &F {
        &self.inner
    }

    fn check(&self, bytes: usize, op: &str) -> io::Result<()> {
        if self.throttle.apply(bytes as u64, 1, &self.user) {
            return Ok(());
        }
        warn!("[ThrottledFile] 用户 {} 的 {} 请求被限流。", self.user, op);
        Err(io::Error::new(
            io::ErrorKind::Other,
            format!("resource limit exceeded for user {}", self.user),
        ))
    }
}

impl<F: StorageFile, T: Throttle> StorageFile for ThrottledFile<F, T> {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<usize> {
        self.check(data.len(), "write")?;
        self.inner.write_at(offset, data)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.check(buf.len(), "read")?;
        self.inner.read_at(offset, buf)
    }

    fn size(&mut self) -> io::Result<u64> {
        self.inner.size()
    }

    fn close(&mut self) -> io::Result<()> {
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io::Cursor;

    /// 按字节数计费的简单配额。
    struct Quota {
        left: Cell<u64>,
    }

    impl Throttle for Quota {
        fn apply(&self, bytes: u64, _ops: u32, _user: &str) -> bool {
            match self.left.get().checked_sub(bytes) {
                Some(left) => {
                    self.left.set(left);
                    true
                }
                None => false,
            }
        }
    }

    #[test]
    fn test_unlimited_passes_through() {
        let mut file = ThrottledFile::new(Cursor::new(Vec::new()), Unlimited, "alice");
        assert_eq!(file.write_at(0, b"abc").unwrap(), 3);
        let mut buf = [0u8; 3];
        assert_eq!(file.read_at(0, &mut buf).unwrap(), 3);
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn test_exhausted_quota_fails_io() {
        let quota = Quota {
            left: Cell::new(4),
        };
        let mut file = ThrottledFile::new(Cursor::new(Vec::new()), quota, "bob");
        file.write_at(0, b"abcd").unwrap();
        let err = file.write_at(4, b"e").unwrap_err();
        assert!(err.to_string().contains("resource limit exceeded"));
        assert_eq!(file.get_ref().get_ref().len(), 4);
    }
}
