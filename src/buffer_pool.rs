use tokio::sync::Mutex;

/// Size of every pooled copy buffer
pub const BUFFER_SIZE: usize = 32 * 1024;

const MAX_POOL_SIZE: usize = 64;

/// Pool of reusable copy buffers backed by an async-aware mutex
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(MAX_POOL_SIZE)),
        }
    }

    /// Get a buffer from the pool or create a new one
    pub async fn get_buffer(&self) -> Vec<u8> {
        let mut pool = self.buffers.lock().await;
        if let Some(buffer) = pool.pop() {
            debug_assert_eq!(buffer.len(), BUFFER_SIZE);
            buffer
        } else {
            vec![0u8; BUFFER_SIZE]
        }
    }

    /// Return a buffer to the pool for reuse
    pub async fn return_buffer(&self, mut buffer: Vec<u8>) {
        // Reject buffers with wrong capacity to avoid memory bloat
        if buffer.capacity() < BUFFER_SIZE || buffer.capacity() > BUFFER_SIZE * 2 {
            return;
        }

        // Zero the buffer on return to avoid leaking data between connections
        buffer.clear();
        buffer.resize(BUFFER_SIZE, 0);

        let mut pool = self.buffers.lock().await;
        if pool.len() < MAX_POOL_SIZE {
            pool.push(buffer);
        }
    }

    /// Number of buffers currently pooled
    #[allow(dead_code)]
    pub async fn available(&self) -> usize {
        self.buffers.lock().await.len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Global buffer pool instance
static BUFFER_POOL: std::sync::OnceLock<BufferPool> = std::sync::OnceLock::new();

fn get_buffer_pool() -> &'static BufferPool {
    BUFFER_POOL.get_or_init(BufferPool::new)
}

/// Convenience function to get a buffer from the global pool
pub async fn get_buffer() -> Vec<u8> {
    get_buffer_pool().get_buffer().await
}

/// Convenience function to return a buffer to the global pool
pub async fn return_buffer(buffer: Vec<u8>) {
    get_buffer_pool().return_buffer(buffer).await;
}
