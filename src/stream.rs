//! 有序写入流：把多个段乱序到达的数据重新拼接为一个顺序的字节流写入本地文件。
//!
//! 每个段只会按顺序写入自己的字节，但不同段之间的完成顺序是任意的。
//! `OrderedStream` 持有一个固定大小的缓冲池（池大小 = 最大并发段数），
//! 每个缓冲条目只接受严格连续的数据，并且只有在条目写满（或强制刷新）
//! 且其偏移量恰好等于写游标时才会提交到文件。
//!
//! 只刷新写满的条目使得“条目非空闲”与“某个段仍有未提交的数据”等价，
//! 编排器据此进行背压计算。

use crate::types::StreamError;
use log::{debug, error, trace, warn};
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

/// 由外部存储层打开并授权的文件句柄。
///
/// 引擎只需要按偏移量读写，以及在成功结束时关闭。
pub trait StorageFile {
    /// 在 `offset` 处写入 `data`，返回写入的字节数。
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<usize>;
    /// 从 `offset` 处读取到 `buf`，返回读取的字节数，0 表示到达末尾。
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
    /// 文件当前的大小。
    fn size(&mut self) -> io::Result<u64>;
    /// 关闭文件，确保数据落盘。
    fn close(&mut self) -> io::Result<()>;
}

impl StorageFile for File {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<usize> {
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(data)?;
        Ok(data.len())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.seek(SeekFrom::Start(offset))?;
        self.read(buf)
    }

    fn size(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn close(&mut self) -> io::Result<()> {
        self.flush()?;
        self.sync_all()
    }
}

impl StorageFile for Cursor<Vec<u8>> {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<usize> {
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(data)?;
        Ok(data.len())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.seek(SeekFrom::Start(offset))?;
        self.read(buf)
    }

    fn size(&mut self) -> io::Result<u64> {
        Ok(self.get_ref().len() as u64)
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// 缓冲池中的一个条目。
#[derive(Debug)]
pub struct BufferEntry {
    /// 条目中第一个字节对应的文件偏移量；`None` 表示空闲。
    offset: Option<u64>,
    capacity: usize,
    data: Vec<u8>,
}

impl BufferEntry {
    fn new(capacity: usize) -> Self {
        Self {
            offset: None,
            capacity,
            // 首次写入时才分配，之后 `reset` 保留已分配的空间。
            data: Vec::new(),
        }
    }

    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_available(&self) -> bool {
        self.offset.is_none()
    }

    pub fn is_full(&self) -> bool {
        self.data.len() == self.capacity
    }

    /// 下一个可以追加到本条目的偏移量。
    fn next_offset(&self) -> Option<u64> {
        self.offset.map(|o| o + self.data.len() as u64)
    }

    /// 尝试接受数据，返回实际接受的字节数。
    ///
    /// 空闲条目接受任意偏移量（首次写入决定条目的偏移量）；
    /// 非空闲条目只接受恰好接在已有数据之后的字节。
    fn accept(&mut self, offset: u64, data: &[u8]) -> usize {
        match self.next_offset() {
            Some(next) if next != offset => return 0,
            None => {
                self.offset = Some(offset);
                self.data.reserve_exact(self.capacity);
            }
            _ => {}
        }
        let room = self.capacity - self.data.len();
        let take = room.min(data.len());
        self.data.extend_from_slice(&data[..take]);
        if self.data.is_empty() {
            self.offset = None;
        }
        take
    }

    /// 条目在当前写游标下是否可以刷新。
    fn can_flush(&self, cursor: u64, force: bool) -> bool {
        self.offset == Some(cursor) && !self.data.is_empty() && (force || self.is_full())
    }

    fn reset(&mut self) {
        self.offset = None;
        self.data.clear();
    }
}

/// 绑定到一个本地文件的有序写入流。
pub struct OrderedStream<F: StorageFile> {
    file: F,
    entries: Vec<BufferEntry>,
    available: usize,
    /// 下一次提交写入所期望的偏移量。
    write_cursor: u64,
    open: bool,
    error: Option<String>,
}

impl<F: StorageFile> OrderedStream<F> {
    /// 创建一个新的有序流。
    ///
    /// - `max_blocks`: 缓冲条目数量，通常等于最大并发段数。
    /// - `block_size`: 每个条目的容量，与段的块大小一致。
    pub fn new(file: F, max_blocks: usize, block_size: usize) -> Self {
        debug!(
            "[OrderedStream] 创建缓冲池: {} 个条目，每个 {} 字节。",
            max_blocks, block_size
        );
        let entries = (0..max_blocks)
            .map(|_| BufferEntry::new(block_size))
            .collect();
        Self {
            file,
            entries,
            available: max_blocks,
            write_cursor: 0,
            open: true,
            error: None,
        }
    }

    /// 写入一段数据，返回被接受的字节数。
    ///
    /// 返回 0 表示当前没有条目能接收这些数据，这是正常的背压信号，
    /// 调用方应在下一轮再试，而不是阻塞等待。
    pub fn write(&mut self, offset: u64, data: &[u8], force: bool) -> Result<usize, StreamError> {
        if !self.open {
            return Err(StreamError::Closed);
        }
        if offset < self.write_cursor {
            return Err(StreamError::OutOfOrder {
                offset,
                cursor: self.write_cursor,
            });
        }
        if data.is_empty() {
            return Ok(0);
        }

        // 先尽量腾出条目，再寻找接收位置。
        self.flush(force)?;

        let accepted = match self
            .entries
            .iter()
            .position(|e| !e.is_full() && e.next_offset() == Some(offset))
        {
            Some(idx) => self.entries[idx].accept(offset, data),
            None => match self.entries.iter().position(BufferEntry::is_available) {
                Some(idx) => {
                    self.available -= 1;
                    self.entries[idx].accept(offset, data)
                }
                None => 0,
            },
        };
        trace!(
            "[OrderedStream] 写入 offset {}，长度 {}，接受 {} 字节。",
            offset,
            data.len(),
            accepted
        );

        // 新写入的数据可能刚好填满了位于游标处的条目。
        self.flush(force)?;
        Ok(accepted)
    }

    /// 刷新所有可以提交的条目，返回写入文件的字节数。
    ///
    /// 只有偏移量等于写游标、并且已写满（或 `force` 为真）的条目才会被提交；
    /// 提交后游标前移，这可能让下一个条目也变得可以提交。
    pub fn flush(&mut self, force: bool) -> Result<usize, StreamError> {
        let mut written = 0;
        loop {
            let cursor = self.write_cursor;
            let Some(idx) = self.entries.iter().position(|e| e.can_flush(cursor, force)) else {
                break;
            };
            let entry = &mut self.entries[idx];
            if let Err(e) = write_all_at(&mut self.file, cursor, &entry.data) {
                error!("[OrderedStream] 写入偏移量 {} 失败: {}", cursor, e);
                self.open = false;
                self.error = Some(e.to_string());
                return Err(StreamError::Io(e));
            }
            let size = entry.data.len();
            entry.reset();
            self.available += 1;
            self.write_cursor += size as u64;
            written += size;
            trace!(
                "[OrderedStream] 已提交 {} 字节，写游标前移至 {}。",
                size,
                self.write_cursor
            );
        }
        Ok(written)
    }

    /// 直接从文件读取，不经过缓冲池，支持任意顺序的随机读取。
    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, StreamError> {
        self.file.read_at(offset, buf).map_err(|e| {
            error!("[OrderedStream] 读取偏移量 {} 失败: {}", offset, e);
            self.error = Some(e.to_string());
            StreamError::Io(e)
        })
    }

    /// 当前空闲的缓冲条目数量。
    pub fn available_buffers(&self) -> usize {
        self.available
    }

    /// 缓冲池大小。
    pub fn buffer_count(&self) -> usize {
        self.entries.len()
    }

    pub fn write_cursor(&self) -> u64 {
        self.write_cursor
    }

    /// 缓冲池中尚未提交的字节数。
    pub fn buffered_bytes(&self) -> usize {
        self.entries.iter().map(BufferEntry::size).sum()
    }

    pub fn entries(&self) -> &[BufferEntry] {
        &self.entries
    }

    /// 最近一次本地 I/O 失败的描述。
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// 本地文件大小（推送模式用来确定上传长度）。
    pub fn file_size(&mut self) -> Result<u64, StreamError> {
        Ok(self.file.size()?)
    }

    pub fn get_ref(&self) -> &F {
        &self.file
    }

    /// 在日志中输出缓冲池的占用情况，用于诊断准入停滞。
    pub fn dump_buffers(&self) {
        debug!(
            "[OrderedStream] 写游标 {}，空闲条目 {}/{}。",
            self.write_cursor,
            self.available,
            self.entries.len()
        );
        for (idx, entry) in self.entries.iter().enumerate() {
            if let Some(offset) = entry.offset {
                debug!(
                    "[OrderedStream] 条目 {}: offset {}，{}/{} 字节。",
                    idx,
                    offset,
                    entry.size(),
                    entry.capacity
                );
            }
        }
    }

    /// 结束写入并关闭文件。
    ///
    /// 只要还有条目未刷新就失败，并且不会关闭文件。
    pub fn finalize(&mut self) -> Result<(), StreamError> {
        let pending = self.entries.len() - self.available;
        if pending > 0 {
            warn!(
                "[OrderedStream] 仍有 {} 个条目未刷新，拒绝关闭文件。",
                pending
            );
            self.dump_buffers();
            return Err(StreamError::IncompleteFlush { pending });
        }
        if !self.open {
            return Err(StreamError::Closed);
        }
        self.file.close()?;
        self.open = false;
        debug!(
            "[OrderedStream] 文件已关闭，共提交 {} 字节。",
            self.write_cursor
        );
        Ok(())
    }
}

fn write_all_at<F: StorageFile>(file: &mut F, mut offset: u64, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        let n = file.write_at(offset, data)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "storage accepted zero bytes",
            ));
        }
        offset += n as u64;
        data = &data[n..];
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 记录每一次文件写入的内存文件。
    #[derive(Default)]
    struct RecordingFile {
        writes: Vec<(u64, usize)>,
        data: Vec<u8>,
        closed: bool,
    }

    impl StorageFile for RecordingFile {
        fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<usize> {
            let end = offset as usize + data.len();
            if self.data.len() < end {
                self.data.resize(end, 0);
            }
            self.data[offset as usize..end].copy_from_slice(data);
            self.writes.push((offset, data.len()));
            Ok(data.len())
        }

        fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
            let start = (offset as usize).min(self.data.len());
            let n = buf.len().min(self.data.len() - start);
            buf[..n].copy_from_slice(&self.data[start..start + n]);
            Ok(n)
        }

        fn size(&mut self) -> io::Result<u64> {
            Ok(self.data.len() as u64)
        }

        fn close(&mut self) -> io::Result<()> {
            self.closed = true;
            Ok(())
        }
    }

    #[test]
    fn test_entry_rejects_non_contiguous_offset() {
        let mut stream = OrderedStream::new(RecordingFile::default(), 1, 8);
        assert_eq!(stream.write(0, b"abc", false).unwrap(), 3);
        // 唯一的条目从 0 开始，只能接受 offset 3。
        assert_eq!(stream.write(5, b"xy", false).unwrap(), 0);
        assert_eq!(stream.write(3, b"de", false).unwrap(), 2);
        assert_eq!(stream.entries()[0].size(), 5);
    }

    #[test]
    fn test_entries_allocate_on_first_write() {
        let mut stream = OrderedStream::new(RecordingFile::default(), 4, 1024);
        assert!(stream.entries.iter().all(|e| e.data.capacity() == 0));

        stream.write(0, b"abc", false).unwrap();
        assert!(stream.entries[0].data.capacity() >= 1024);
        assert!(stream.entries[1..].iter().all(|e| e.data.capacity() == 0));
    }

    #[test]
    fn test_partial_entry_is_not_flushed() {
        let mut stream = OrderedStream::new(RecordingFile::default(), 2, 8);
        stream.write(0, b"hello", false).unwrap();
        stream.flush(false).unwrap();
        assert!(stream.get_ref().writes.is_empty());
        assert_eq!(stream.available_buffers(), 1);

        assert_eq!(stream.flush(true).unwrap(), 5);
        assert_eq!(stream.get_ref().writes, vec![(0, 5)]);
        assert_eq!(stream.available_buffers(), 2);
    }

    #[test]
    fn test_full_entries_flush_in_cursor_order() {
        let mut stream = OrderedStream::new(RecordingFile::default(), 3, 4);
        // 第二块先到达并写满，但游标仍在 0，不能提交。
        assert_eq!(stream.write(4, b"EFGH", false).unwrap(), 4);
        assert!(stream.get_ref().writes.is_empty());
        assert_eq!(stream.available_buffers(), 2);

        // 第一块写满后，两个条目依次提交。
        assert_eq!(stream.write(0, b"ABCD", false).unwrap(), 4);
        assert_eq!(stream.get_ref().writes, vec![(0, 4), (4, 4)]);
        assert_eq!(stream.write_cursor(), 8);
        assert_eq!(stream.available_buffers(), 3);
        assert_eq!(&stream.get_ref().data, b"ABCDEFGH");
    }

    #[test]
    fn test_write_returns_zero_when_pool_exhausted() {
        let mut stream = OrderedStream::new(RecordingFile::default(), 2, 4);
        stream.write(4, b"ab", false).unwrap();
        stream.write(8, b"cd", false).unwrap();
        assert_eq!(stream.available_buffers(), 0);
        assert_eq!(stream.write(12, b"ef", false).unwrap(), 0);
    }

    #[test]
    fn test_entry_accepts_only_remaining_capacity() {
        let mut stream = OrderedStream::new(RecordingFile::default(), 2, 4);
        assert_eq!(stream.write(4, b"abcdef", false).unwrap(), 4);
        assert_eq!(stream.entries().iter().filter(|e| e.is_full()).count(), 1);
    }

    #[test]
    fn test_out_of_order_rewrite_is_an_error() {
        let mut stream = OrderedStream::new(RecordingFile::default(), 1, 2);
        stream.write(0, b"ab", false).unwrap();
        assert_eq!(stream.write_cursor(), 2);
        assert!(matches!(
            stream.write(0, b"zz", false),
            Err(StreamError::OutOfOrder { offset: 0, cursor: 2 })
        ));
    }

    #[test]
    fn test_finalize_refuses_with_pending_entry() {
        let mut stream = OrderedStream::new(RecordingFile::default(), 2, 8);
        stream.write(0, b"abc", false).unwrap();
        assert!(matches!(
            stream.finalize(),
            Err(StreamError::IncompleteFlush { pending: 1 })
        ));
        assert!(!stream.get_ref().closed);

        stream.flush(true).unwrap();
        stream.finalize().unwrap();
        assert!(stream.get_ref().closed);
        assert!(matches!(stream.write(3, b"x", false), Err(StreamError::Closed)));
    }

    #[test]
    fn test_read_is_unbuffered_passthrough() {
        let file = Cursor::new(b"0123456789".to_vec());
        let mut stream = OrderedStream::new(file, 1, 4);
        let mut buf = [0u8; 3];
        assert_eq!(stream.read(7, &mut buf).unwrap(), 3);
        assert_eq!(&buf, b"789");
        assert_eq!(stream.read(2, &mut buf).unwrap(), 3);
        assert_eq!(&buf, b"234");
    }
}
