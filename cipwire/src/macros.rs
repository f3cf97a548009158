#[macro_export]
/// int_enum derives a wire enum from a set of numbers that can be read and
/// written as the underlying integer type.
macro_rules! int_enum {
    (
        $(#[$outer:meta])*
        $v:vis enum $EnumName:ident : $Type:ty{
            $(
                $(#[$inner:ident $($args:tt)*])*
                $Variant:ident = $Value:expr,
            )+
        }
    ) => {
        $(#[$outer])*
        $v enum $EnumName {
            $(
                $(#[$inner $($args)*])*
                $Variant,
            )+
        }

        impl ::std::convert::TryFrom<$Type> for $EnumName {
            type Error = String;

            fn try_from(value: $Type) -> Result<Self, String> {
                match value {
                    $(
                        $Value => Ok($EnumName::$Variant),
                    )+
                    _ => Err(format!("{:?} is not a valid {}", value, stringify!($EnumName)))
                }
            }
        }

        impl From<&$EnumName> for $Type {
            fn from(e: &$EnumName) -> $Type {
                match e {
                    $(
                        $EnumName::$Variant => $Value,
                    )+
                }
            }
        }

        impl From<$EnumName> for $Type {
            fn from(e: $EnumName) -> $Type {
                <$Type>::from(&e)
            }
        }

        impl $crate::Size for $EnumName {
            fn size(&self) -> usize {
                let val: $Type = self.into();
                $crate::Size::size(&val)
            }
        }

        impl $crate::ReadFrom for $EnumName {
            fn read_from<T: ::std::io::Read>(source: &mut T) -> ::std::io::Result<Self> {
                let val = <$Type as $crate::ReadFrom>::read_from(source)?;

                match val {
                    $(
                        $Value => Ok($EnumName::$Variant),
                    )+
                    _ => {
                        Err(::std::io::Error::new(::std::io::ErrorKind::InvalidData, format!("invalid value for {}: {}", stringify!($EnumName), val)))
                    }
                }
            }
        }

        impl $crate::WriteTo for $EnumName {
            fn write_to<W: ::std::io::Write>(&self, writer: &mut W) -> ::std::io::Result<()> {
                let val: $Type = match self {
                    $(
                        $EnumName::$Variant => $Value,
                    )+
                };

                $crate::WriteTo::write_to(&val, writer)
            }
        }
    }
}
