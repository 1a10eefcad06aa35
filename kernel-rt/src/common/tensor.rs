use crate::{ByteOf, Hardware};
use digit_layout::DigitLayout;
use std::fmt;

/// 连续张量的数据类型和形状。
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TensorLayout {
    pub dt: DigitLayout,
    pub shape: Vec<usize>,
}

impl TensorLayout {
    #[inline]
    pub fn new(dt: DigitLayout, shape: &[usize]) -> Self {
        Self {
            dt,
            shape: shape.to_vec(),
        }
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    #[inline]
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    #[inline]
    pub fn nbytes(&self) -> usize {
        self.element_count() * self.dt.nbytes() as usize
    }
}

/// 张量视图：布局和硬件上的基址，不持有存储。
pub struct Tensor<H: Hardware> {
    pub layout: TensorLayout,
    pub base: *mut ByteOf<H>,
}

impl<H: Hardware> Tensor<H> {
    #[inline]
    pub fn new(layout: TensorLayout, base: *mut ByteOf<H>) -> Self {
        Self { layout, base }
    }
}

impl<H: Hardware> Clone for Tensor<H> {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            layout: self.layout.clone(),
            base: self.base,
        }
    }
}

impl<H: Hardware> fmt::Debug for Tensor<H> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Tensor({:?}{:?} @ {:p})",
            self.layout.dt, self.layout.shape, self.base
        )
    }
}

unsafe impl<H: Hardware> Send for Tensor<H> {}
unsafe impl<H: Hardware> Sync for Tensor<H> {}

#[test]
fn test_layout() {
    use digit_layout::types::F32;

    let layout = TensorLayout::new(F32, &[2, 3, 4]);
    assert_eq!(layout.ndim(), 3);
    assert_eq!(layout.element_count(), 24);
    assert_eq!(layout.nbytes(), 96);
}
