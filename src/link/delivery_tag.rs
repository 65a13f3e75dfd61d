/// Delivery tags are non-negative and fit into a signed 32 bit integer
pub type DeliveryTag = u32;

pub const MAX_DELIVERY_TAG: DeliveryTag = i32::MAX as DeliveryTag;

/// Hands out delivery tags for one sender link: 0, 1, 2, ... up to [MAX_DELIVERY_TAG], then
///  starting over at 0. With single credit flow a tag is acknowledged long before it comes
///  around again.
#[derive(Debug, Default)]
pub struct DeliveryTagAllocator {
    next: DeliveryTag,
}

impl DeliveryTagAllocator {
    pub fn new() -> DeliveryTagAllocator {
        DeliveryTagAllocator::default()
    }

    pub fn next_tag(&mut self) -> DeliveryTag {
        let result = self.next;
        self.next = if self.next >= MAX_DELIVERY_TAG { 0 } else { self.next + 1 };
        result
    }

    /// the on-the-wire representation: decimal ASCII digits
    pub fn encode(tag: DeliveryTag) -> Vec<u8> {
        tag.to_string().into_bytes()
    }

    pub fn decode(raw: &[u8]) -> Option<DeliveryTag> {
        let tag = std::str::from_utf8(raw).ok()?
            .parse::<DeliveryTag>().ok()?;
        (tag <= MAX_DELIVERY_TAG).then_some(tag)
    }
}
