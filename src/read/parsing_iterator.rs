use crate::read::ParseResult;
use crate::IdSize;
use std::marker;

/// Parses `count` consecutive values of one type
pub struct ParsingIterator<'a, T, P: Parser<T>> {
    parser: P,
    count: u32,
    remaining: &'a [u8],
    phantom: marker::PhantomData<T>,
}

impl<'a, S: StatelessParserWithId> ParsingIterator<'a, S, IdSizeParserWrapper<S>> {
    pub fn new_stateless_id_size(
        id_size: IdSize,
        remaining: &'a [u8],
        count: u32,
    ) -> ParsingIterator<'a, S, IdSizeParserWrapper<S>> {
        ParsingIterator {
            parser: IdSizeParserWrapper {
                id_size,
                phantom: marker::PhantomData,
            },
            count,
            remaining,
            phantom: marker::PhantomData,
        }
    }
}

impl<'a, S: StatelessParser> ParsingIterator<'a, S, StatelessParserWrapper<S>> {
    pub fn new_stateless(
        remaining: &'a [u8],
        count: u32,
    ) -> ParsingIterator<'a, S, StatelessParserWrapper<S>> {
        ParsingIterator {
            parser: StatelessParserWrapper {
                phantom: marker::PhantomData,
            },
            count,
            remaining,
            phantom: marker::PhantomData,
        }
    }
}

impl<'a, T, P: Parser<T>> Iterator for ParsingIterator<'a, T, P> {
    type Item = ParseResult<'a, T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.count == 0 {
            return None;
        }

        match self.parser.parse(self.remaining) {
            Ok((input, val)) => {
                self.remaining = input;
                self.count -= 1;
                Some(Ok(val))
            }
            Err(e) => {
                self.count = 0;
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.count as usize))
    }
}

pub trait Parser<T>: Sized {
    fn parse<'a>(&self, input: &'a [u8]) -> nom::IResult<&'a [u8], T>;
}

/// For fixed-width values that parse the same way in every file
pub trait StatelessParser: Sized {
    fn parse(input: &[u8]) -> nom::IResult<&[u8], Self>;
}

/// For values whose width depends on the file's id size
pub trait StatelessParserWithId: Sized {
    fn parse(input: &[u8], id_size: IdSize) -> nom::IResult<&[u8], Self>;
}

pub struct IdSizeParserWrapper<P: StatelessParserWithId> {
    id_size: IdSize,
    phantom: marker::PhantomData<P>,
}

impl<P: StatelessParserWithId> Parser<P> for IdSizeParserWrapper<P> {
    fn parse<'a>(&self, input: &'a [u8]) -> nom::IResult<&'a [u8], P> {
        P::parse(input, self.id_size)
    }
}

pub struct StatelessParserWrapper<P: StatelessParser> {
    phantom: marker::PhantomData<P>,
}

impl<P: StatelessParser> Parser<P> for StatelessParserWrapper<P> {
    fn parse<'a>(&self, input: &'a [u8]) -> nom::IResult<&'a [u8], P> {
        P::parse(input)
    }
}
