/// A 256-byte circular Uxn stack.
///
/// The pointer wraps on both overflow and underflow; shorts are stored
/// big-endian (high byte pushed first).
#[derive(Debug, Clone)]
pub struct UxnStack {
    data: [u8; 0x100],
    ptr: u8,
}

impl UxnStack {
    pub fn new() -> Self {
        Self {
            data: [0; 0x100],
            ptr: 0,
        }
    }

    pub fn ptr(&self) -> u8 {
        self.ptr
    }

    pub fn set_ptr(&mut self, ptr: u8) {
        self.ptr = ptr;
    }

    pub fn push(&mut self, value: u8) {
        self.data[self.ptr as usize] = value;
        self.ptr = self.ptr.wrapping_add(1);
    }

    pub fn pop(&mut self) -> u8 {
        self.ptr = self.ptr.wrapping_sub(1);
        self.data[self.ptr as usize]
    }

    pub fn push2(&mut self, value: u16) {
        let [hi, lo] = value.to_be_bytes();
        self.push(hi);
        self.push(lo);
    }

    pub fn pop2(&mut self) -> u16 {
        let lo = self.pop();
        let hi = self.pop();
        u16::from_be_bytes([hi, lo])
    }

    /// The currently occupied bytes, bottom first.
    pub fn used(&self) -> &[u8] {
        &self.data[..self.ptr as usize]
    }
}

impl Default for UxnStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shorts_are_big_endian() {
        let mut s = UxnStack::new();
        s.push2(0x1234);
        assert_eq!(s.used(), &[0x12, 0x34]);
        assert_eq!(s.pop2(), 0x1234);
        assert_eq!(s.ptr(), 0);
    }

    #[test]
    fn pointer_wraps_on_underflow() {
        let mut s = UxnStack::new();
        s.pop();
        assert_eq!(s.ptr(), 0xFF);
        s.push(1);
        assert_eq!(s.ptr(), 0);
    }
}
