mod common;

use iomgr::{IoManagerBuilder, IomgrError, StartOptions, ThreadRegex};

use proptest::prelude::*;

use std::sync::{Arc, Mutex};

#[test]
fn test_stopped_manager_uses_system_allocator() {
    let iomgr = IoManagerBuilder::new().build();

    let buf = iomgr.iobuf_alloc(512, 4096).unwrap();
    assert_eq!(buf.allocator(), "system");
    assert_eq!(buf.as_ptr() as usize % 512, 0);
    assert!(buf.iter().all(|&b| b == 0));

    iomgr.iobuf_free(buf);
}

#[test]
fn test_allocator_follows_backend() {
    common::init_tracing();

    let iomgr = IoManagerBuilder::new().build();

    iomgr
        .start(StartOptions::new(1).polling_backend(true))
        .unwrap();
    assert_eq!(iomgr.iobuf_alloc(4096, 8192).unwrap().allocator(), "pinned");
    iomgr.stop().unwrap();

    iomgr.start(StartOptions::new(1)).unwrap();
    assert_eq!(iomgr.iobuf_alloc(4096, 8192).unwrap().allocator(), "system");
    iomgr.stop().unwrap();
}

#[test]
fn test_buffers_cross_reactors() {
    let iomgr = IoManagerBuilder::new().build();
    iomgr.start(StartOptions::new(2)).unwrap();

    let mut buf = iomgr.iobuf_alloc(4096, 4096).unwrap();
    buf[..5].copy_from_slice(b"hello");

    // Freed on a reactor thread.
    let slot = Arc::new(Mutex::new(Some(buf)));
    {
        let slot = slot.clone();
        let me = iomgr.clone();
        iomgr.run_on(
            ThreadRegex::RandomWorker,
            move || {
                if let Some(buf) = slot.lock().unwrap().take() {
                    assert_eq!(&buf[..5], b"hello");
                    me.iobuf_free(buf);
                }
            },
            true,
        );
    }
    assert!(slot.lock().unwrap().is_none());

    iomgr.stop().unwrap();
}

#[test]
fn test_invalid_alignment() {
    let iomgr = IoManagerBuilder::new().build();

    assert!(matches!(
        iomgr.iobuf_alloc(48, 100),
        Err(IomgrError::Alloc { size: 100, align: 48 })
    ));
}

#[test]
fn test_failed_realloc_keeps_data() {
    let iomgr = IoManagerBuilder::new().build();

    let mut buf = iomgr.iobuf_alloc(512, 32).unwrap();
    buf.fill(0x5A);

    assert!(matches!(
        iomgr.iobuf_realloc(&mut buf, 3, 16),
        Err(IomgrError::Alloc { size: 16, align: 3 })
    ));
    assert_eq!(buf.len(), 32);
    assert_eq!(buf.as_ptr() as usize % 512, 0);
    assert!(buf.iter().all(|&b| b == 0x5A));

    iomgr.iobuf_free(buf);
}

proptest! {
    #[test]
    fn test_realloc_keeps_prefix(
        align_shift in 0u32..13,
        size in 0usize..20_000,
        new_size in 0usize..20_000,
        fill in any::<u8>(),
    ) {
        let iomgr = IoManagerBuilder::new().build();
        let align = 1usize << align_shift;

        let mut buf = iomgr.iobuf_alloc(align, size).unwrap();
        buf.fill(fill);

        iomgr.iobuf_realloc(&mut buf, align, new_size).unwrap();
        let kept = size.min(new_size);

        prop_assert_eq!(buf.len(), new_size);
        prop_assert_eq!(buf.as_ptr() as usize % align, 0);
        prop_assert!(buf[..kept].iter().all(|&b| b == fill));
        prop_assert!(buf[kept..].iter().all(|&b| b == 0));
    }
}
