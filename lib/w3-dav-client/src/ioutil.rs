/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::future::Future;
use std::io;
use std::mem;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use tokio::io::AsyncBufRead;

pub(crate) struct LimitedReadUntil<'a, R: ?Sized> {
    reader: &'a mut R,
    delimiter: u8,
    read: usize,
    limit: usize,
    buf: &'a mut Vec<u8>,
}

fn read_until_internal<R: AsyncBufRead + ?Sized>(
    mut reader: Pin<&mut R>,
    cx: &mut Context<'_>,
    delimiter: u8,
    buf: &mut Vec<u8>,
    read: &mut usize,
    limit: usize,
) -> Poll<io::Result<(bool, usize)>> {
    loop {
        let (done, used) = {
            let available = ready!(reader.as_mut().poll_fill_buf(cx))?;
            if let Some(i) = memchr::memchr(delimiter, available) {
                buf.extend_from_slice(&available[..=i]);
                (true, i + 1)
            } else {
                buf.extend_from_slice(available);
                (false, available.len())
            }
        };
        reader.as_mut().consume(used);
        *read += used;
        if done {
            return Poll::Ready(Ok((true, mem::replace(read, 0))));
        }
        if used == 0 || *read >= limit {
            return Poll::Ready(Ok((false, mem::replace(read, 0))));
        }
    }
}

impl<R: AsyncBufRead + ?Sized + Unpin> Future for LimitedReadUntil<'_, R> {
    type Output = io::Result<(bool, usize)>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let me = self.get_mut();
        read_until_internal(
            Pin::new(&mut *me.reader),
            cx,
            me.delimiter,
            me.buf,
            &mut me.read,
            me.limit,
        )
    }
}

pub(crate) trait LimitedBufReadExt: AsyncBufRead {
    /// read one delimiter-terminated line, bounded; returns whether the
    /// delimiter was found and how many bytes were appended
    fn limited_read_until<'a>(
        &'a mut self,
        delimiter: u8,
        max_len: usize,
        buf: &'a mut Vec<u8>,
    ) -> LimitedReadUntil<'a, Self>
    where
        Self: Unpin,
    {
        LimitedReadUntil {
            reader: self,
            delimiter,
            read: 0,
            limit: max_len,
            buf,
        }
    }
}

impl<R: AsyncBufRead + ?Sized> LimitedBufReadExt for R {}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn read_lines() {
        let data: &[u8] = b"line one\r\nline two\r\n";
        let mut reader = BufReader::new(data);
        let mut buf = Vec::new();
        let (found, nr) = reader.limited_read_until(b'\n', 1024, &mut buf).await.unwrap();
        assert!(found);
        assert_eq!(nr, 10);
        assert_eq!(buf, b"line one\r\n");

        buf.clear();
        let (found, _) = reader.limited_read_until(b'\n', 1024, &mut buf).await.unwrap();
        assert!(found);
        assert_eq!(buf, b"line two\r\n");

        buf.clear();
        let (found, nr) = reader.limited_read_until(b'\n', 1024, &mut buf).await.unwrap();
        assert!(!found);
        assert_eq!(nr, 0);
    }

    #[tokio::test]
    async fn bounded_line() {
        let data: &[u8] = b"aaaaaaaaaaaaaaaaaaaa\n";
        let mut reader = BufReader::new(data);
        let mut buf = Vec::new();
        let (found, nr) = reader.limited_read_until(b'\n', 8, &mut buf).await.unwrap();
        assert!(!found);
        assert!(nr >= 8);
    }

}
